/*
  Copyright© 2022 Raúl Wolters(1)

  This file is part of rustronomy-core.

  rustronomy is free software: you can redistribute it and/or modify it under
  the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  rustronomy is distributed in the hope that it will be useful, but WITHOUT ANY
  WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
  A PARTICULAR PURPOSE. See the European Union Public License for more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with rustronomy.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

#![doc(
  html_logo_url = "https://raw.githubusercontent.com/smups/rustronomy/main/logos/Rustronomy_ferris.png?raw=true"
)]
//! Rustronomy-levelset is a pure-rust implementation of the fast two-cycle
//! level-set segmentation algorithm (see Shi & Karl, 2005[^1], 2008[^2]).
//!
//! # Overview
//! The algorithm evolves a closed curve over a 2D grayscale raster until it
//! settles on the boundary of a bright (or dark) region. The curve is stored
//! implicitly: every grid cell carries one of four small integers
//! (-3, -1, +1, +3) and the curve is the interface between the negative and
//! positive cells. The cells valued -1 and +1 form a two-pixel narrow band
//! which is also kept in two explicit point lists, so each evolution step only
//! touches the boundary instead of the full raster. No floating-point state is
//! attached to the grid, which makes a single evolution step extremely cheap.
//!
//! Each full iteration consists of two cycles:
//! 1. a *speed* cycle, in which boundary points are switched between inside
//!    and outside according to a data-driven speed field, and
//! 2. a *smoothing* cycle, in which the boundary is relaxed by thresholding a
//!    small integer Gaussian convolved with the inside indicator.
//!
//! Two speed fields are included:
//! - [`ChanVeseSpeedField`]: the global region criterion of Chan & Vese[^3],
//!   with incrementally maintained inside/outside mean intensities.
//! - [`HybridSpeedField`]: the local-region variant of Lankton et al.[^4],
//!   which evaluates the same criterion in a square window around each
//!   boundary point.
//!
//! # Quickstart
//! Segmentations are configured through the `SegmenterBuilder` struct. Once
//! the desired parameters are set, `build()` seeds a [`FastLevelSet`] engine
//! from an image and a binary initialisation mask. Calling `segment()` runs
//! the evolution; the resulting foreground mask is obtained with
//! `segmentation()`.
//!
//! ```rust
//! use ndarray as nd;
//! use rustronomy_levelset::prelude::*;
//!
//! //A dim image with a bright block in the middle
//! let mut img = nd::Array2::<i32>::from_elem((16, 16), 10);
//! img.slice_mut(nd::s![4..12, 4..12]).fill(200);
//!
//! //Seed the curve with two pixels inside the block
//! let mut init = nd::Array2::<u8>::zeros((16, 16));
//! init[[8, 7]] = 255;
//! init[[8, 8]] = 255;
//!
//! let mut ls = SegmenterBuilder::new_chan_vese()
//!   .set_max_iterations(10)
//!   .set_smooth_iterations(0)
//!   .build(img.view(), init.view())
//!   .unwrap();
//! ls.segment().unwrap();
//!
//! let seg = ls.segmentation();
//! assert_eq!(seg[[8, 8]], 255);
//! assert_eq!(seg[[0, 0]], 0);
//! ```
//! [^1]: Y. Shi and W. C. Karl. **Real-time tracking using level sets.** *CVPR*, 2005.
//!
//! [^2]: Y. Shi and W. C. Karl. **A real-time algorithm for the approximation of level-set-based curve evolution.** *IEEE Trans. Image Processing*, 2008.
//!
//! [^3]: T. Chan and L. Vese. **Active contours without edges.** *IEEE Trans. Image Processing*, 2001.
//!
//! [^4]: S. Lankton, D. Nain, A. Yezzi and A. Tannenbaum. **Hybrid geodesic region-based curve evolutions for image segmentation.** *SPIE Medical Imaging*, 2007.
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `progress`: this feature enables a progress bar over the outer evolution
//! iterations. Enabling this feature adds the `indicatif` crate as a
//! dependency, which should not considerably slow down compile times.
//! - `debug`: with this feature enabled, the full list/grid consistency check
//! runs after every sweep (and panics on the first violation), and a
//! performance summary is printed once a segmentation completes. This can
//! negatively impact performance. Enabling this feature does not add
//! additional dependencies.
//! - `serde`: derives `Serialize`/`Deserialize` for the parameter structs.
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! From the jemalloc website: *"jemalloc is a general purpose `malloc`(3)
//! implementation that emphasizes fragmentation avoidance and scalable
//! concurrency support."*. Jemalloc is enabled though usage of the `jemalloc`
//! crate, which increases compile times considerably. To compile
//! `rustronomy-levelset` with the `jemalloc` feature, jemalloc must be
//! installed on the host system.

//Unconditional imports
use arrayvec::ArrayVec;
use log::{debug, info};
use ndarray as nd;
use num_traits::{Num, ToPrimitive};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

//Progress bar (conditional)
#[cfg(feature = "progress")]
use indicatif;

//Largest admissible pre-scale of the smoothing kernel. The kernel is scaled
//by its number of cells (2g+1)², so this bounds the half-width g at 7.
const MAX_KERNEL_SCALE: usize = 255;

//Utility prelude for batch import
pub mod prelude {
  pub use crate::{
    create_speed_field, BoundaryObserver, ChanVeseSpeedField, FastLevelSet, HybridParameters,
    HybridSpeedField, IterationObserver, LevelSetError, LevelSetUtils, Parameters,
    SegmenterBuilder, SfMethod, SpeedField,
  };
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "progress")]
fn set_up_bar(max_iterations: usize) -> indicatif::ProgressBar {
  const TEMPLATE: &str = "{spinner}[{elapsed}/{duration}] iteration {pos}/{len}{bar:60}";
  let style = indicatif::ProgressStyle::with_template(TEMPLATE);
  let bar = indicatif::ProgressBar::new(max_iterations as u64);
  bar.set_style(style.unwrap());
  return bar;
}

/// Collects the in-bounds 4-connected neighbours of `(x, y)` into a
/// fixed-capacity buffer. Between 2 (corner) and 4 (interior) points.
#[inline]
fn neighbours_4con(
  (x, y): (usize, usize),
  width: usize,
  height: usize,
) -> ArrayVec<(usize, usize), 4> {
  let mut nhood = ArrayVec::new();
  if x + 1 < width {
    nhood.push((x + 1, y));
  }
  if y + 1 < height {
    nhood.push((x, y + 1));
  }
  if y > 0 {
    nhood.push((x, y - 1));
  }
  if x > 0 {
    nhood.push((x - 1, y));
  }
  nhood
}

/// Quantizes a continuous speed into the sign convention consumed by the
/// evolution loop.
///
/// Speed fields use the conventional definition in which a positive speed
/// contracts the boundary (the signed level-set function is negative inside,
/// so a positive rate of change pushes boundary cells outside). The two-cycle
/// evolution instead treats +1 as "switch this point in" and -1 as "switch
/// this point out", hence the sign flip. A speed of zero (or a non-finite
/// speed) maps to zero.
#[inline]
pub fn fls_sign(s: f64) -> i8 {
  if s > 0.0 {
    -1
  } else if s < 0.0 {
    1
  } else {
    0
  }
}

/// Creates the integer Gaussian smoothing kernel and its switch threshold.
///
/// The kernel holds `(2g+1)²` truncated weights
/// `w(dx, dy) = (1/σ²)·exp(-(dx² + dy²)/(2σ²))·(2g+1)²`; the threshold is
/// half the total weight. The pre-scale `(2g+1)²` may not exceed 255, so
/// that every weight fits comfortably in a small integer.
fn create_gauss_filter(
  gauss_width: usize,
  gauss_sigma: f64,
) -> Result<(nd::Array2<u16>, u32), LevelSetError> {
  let s = 2 * gauss_width + 1;

  //Rough heuristic: scale by the number of cells in the kernel
  let scale = s * s;
  if scale > MAX_KERNEL_SCALE {
    return Err(LevelSetError::Config(format!(
      "smoothing kernel of {s}x{s} cells is too large (pre-scale {scale} exceeds \
       {MAX_KERNEL_SCALE}); the kernel half-width may be at most 7"
    )));
  }

  let mut filter = nd::Array2::<u16>::zeros((s, s));
  let mut total = 0u32;
  for y in 0..s {
    for x in 0..s {
      let dx = x as f64 - gauss_width as f64;
      let dy = y as f64 - gauss_width as f64;
      let d2 = dx * dx + dy * dy;
      let gf = 1.0 / gauss_sigma / gauss_sigma
        * (-0.5 / gauss_sigma / gauss_sigma * d2).exp()
        * scale as f64;
      filter[[y, x]] = gf as u16;
      total += filter[[y, x]] as u32;
    }
  }

  Ok((filter, total / 2))
}

////////////////////////////////////////////////////////////////////////////////
//                                  ERRORS                                    //
////////////////////////////////////////////////////////////////////////////////

/// Everything that can go wrong while configuring or running a segmentation.
#[derive(Debug, Clone, PartialEq)]
pub enum LevelSetError {
  /// Invalid configuration: mismatched raster dimensions, an empty raster,
  /// an oversized smoothing kernel or a non-positive sigma.
  Config(String),
  /// The requested speed-field method is recognized but not implemented.
  NotImplemented(&'static str),
  /// The initialisation mask puts every pixel on one side of the boundary,
  /// so the region statistics would be undefined.
  EmptyPartition { inside: usize, outside: usize },
  /// The caller requested cancellation between sub-iterations. The
  /// segmentation output must not be consumed after this.
  Cancelled,
  /// The boundary lists and the level-set grid disagree. This indicates a
  /// bug in the evolution engine and is fatal when raised by the automatic
  /// `debug`-feature checks.
  Inconsistent(String),
}

impl std::fmt::Display for LevelSetError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      LevelSetError::Config(msg) => write!(f, "invalid configuration: {msg}"),
      LevelSetError::NotImplemented(what) => {
        write!(f, "speed field method not implemented: {what}")
      }
      LevelSetError::EmptyPartition { inside, outside } => write!(
        f,
        "initialisation does not split the image: {inside} pixel(s) inside, {outside} outside"
      ),
      LevelSetError::Cancelled => write!(f, "segmentation cancelled"),
      LevelSetError::Inconsistent(msg) => write!(f, "boundary lists are inconsistent: {msg}"),
    }
  }
}

impl std::error::Error for LevelSetError {}

////////////////////////////////////////////////////////////////////////////////
//                             OPTIONAL MODULES                               //
////////////////////////////////////////////////////////////////////////////////
#[cfg(feature = "debug")]
mod performance_monitoring {

  #[derive(Clone, Debug, Default)]
  pub struct PerfReport {
    pub speed_sweep_ms: Vec<usize>,
    pub smooth_sweep_ms: Vec<usize>,
    pub iterations: usize,
    pub total_ms: usize,
  }

  impl PerfReport {
    pub fn speed_avg(&self) -> f64 {
      let num = self.speed_sweep_ms.len() as f64;
      self.speed_sweep_ms.iter().map(|&x| x as f64).sum::<f64>() / num
    }
    pub fn speed_total(&self) -> f64 {
      self.speed_sweep_ms.iter().map(|&x| x as f64).sum()
    }
    pub fn smooth_avg(&self) -> f64 {
      let num = self.smooth_sweep_ms.len() as f64;
      self.smooth_sweep_ms.iter().map(|&x| x as f64).sum::<f64>() / num
    }
    pub fn smooth_total(&self) -> f64 {
      self.smooth_sweep_ms.iter().map(|&x| x as f64).sum()
    }
  }

  impl std::fmt::Display for PerfReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      writeln!(f, ">---------[Performance Summary]---------")?;
      writeln!(f, ">  Completed {} full iteration(s)", self.iterations)?;
      writeln!(
        f,
        ">  Speed Sweep Average: {:.1}ms; Σ {:.0}ms",
        self.speed_avg(),
        self.speed_total()
      )?;
      writeln!(
        f,
        ">  Smooth Sweep Average: {:.1}ms; Σ {:.0}ms",
        self.smooth_avg(),
        self.smooth_total()
      )?;
      writeln!(f, ">--------------------------------+ total")?;
      writeln!(
        f,
        ">  {}ms with {:.1}ms overhead (Δt)",
        self.total_ms,
        self.total_ms as f64 - self.speed_total() - self.smooth_total()
      )
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                          PARAMETERS & BUILDER                              //
////////////////////////////////////////////////////////////////////////////////

/// Parameters of the two-cycle evolution.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Parameters {
  /// Maximum number of full (speed + smooth) iterations.
  pub max_iterations: usize,
  /// Number of speed sub-iterations per full iteration.
  pub speed_iterations: usize,
  /// Number of smoothing sub-iterations per full iteration.
  pub smooth_iterations: usize,
  /// Half-width of the Gaussian smoothing kernel; the kernel spans
  /// `2 * gauss_width + 1` cells per side.
  pub gauss_width: usize,
  /// Standard deviation of the Gaussian smoothing kernel. Must be positive
  /// when smoothing is enabled.
  pub gauss_sigma: f64,
}

impl Default for Parameters {
  fn default() -> Self {
    Parameters {
      max_iterations: 10,
      speed_iterations: 5,
      smooth_iterations: 2,
      gauss_width: 3,
      gauss_sigma: 3.0,
    }
  }
}

/// Parameters of the local-region (hybrid) speed field.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HybridParameters {
  /// Half-edge of the square statistics window around each query point.
  pub neighbourhood_radius: usize,
  /// Soft cut-off for bright pixels; 0 disables the pre-filter.
  pub cutoff_intensity: i32,
}

impl Default for HybridParameters {
  fn default() -> Self {
    HybridParameters { neighbourhood_radius: 16, cutoff_intensity: 0 }
  }
}

/// The available speed-field methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SfMethod {
  /// Global region criterion with incrementally maintained statistics.
  #[default]
  ChanVese,
  /// Local-region criterion evaluated in a moving window.
  Hybrid,
  /// Geodesic active contours. Recognized, but not implemented: requesting
  /// it fails at construction time.
  Edge,
}

impl std::fmt::Display for SfMethod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SfMethod::ChanVese => write!(f, "region (Chan-Vese)"),
      SfMethod::Hybrid => write!(f, "local region (hybrid)"),
      SfMethod::Edge => write!(f, "edge (geodesic active contours)"),
    }
  }
}

/// Creates a speed field of the requested method.
///
/// The initialisation mask is only used to seed the statistics of the
/// region-based field; the hybrid field carries no cross-iteration state.
/// Requesting [`SfMethod::Edge`] returns a
/// [`LevelSetError::NotImplemented`].
pub fn create_speed_field<'a>(
  method: SfMethod,
  im: nd::ArrayView2<'a, i32>,
  init: nd::ArrayView2<'_, u8>,
  hybrid: &HybridParameters,
) -> Result<Box<dyn SpeedField + 'a>, LevelSetError> {
  match method {
    SfMethod::ChanVese => Ok(Box::new(ChanVeseSpeedField::new(im, init)?)),
    SfMethod::Hybrid => Ok(Box::new(HybridSpeedField::new(hybrid.clone(), im))),
    SfMethod::Edge => Err(LevelSetError::NotImplemented("edge (geodesic active contours)")),
  }
}

/// Builder for configuring a fast level-set segmentation.
///
/// Use the `new_chan_vese()` associated function to start configuring a
/// segmentation driven by the global region criterion, or `new_hybrid()` for
/// the local-region criterion. Once the desired parameters are set, an engine
/// is seeded from an image and an initialisation mask with the `build()`
/// associated function.
///
/// All parameters come with the defaults listed in [`Parameters`] and
/// [`HybridParameters`].
#[derive(Debug, Clone, Default)]
pub struct SegmenterBuilder {
  method: SfMethod,
  params: Parameters,
  hybrid: HybridParameters,
  cancel: Option<Arc<AtomicBool>>,
}

impl SegmenterBuilder {
  /// creates a new `SegmenterBuilder` for the given speed-field method
  pub fn new(method: SfMethod) -> Self {
    SegmenterBuilder { method, ..Self::default() }
  }

  /// creates a new `SegmenterBuilder` configured for the global region
  /// (Chan-Vese) criterion
  pub fn new_chan_vese() -> Self {
    Self::new(SfMethod::ChanVese)
  }

  /// creates a new `SegmenterBuilder` configured for the local-region
  /// (hybrid) criterion
  pub fn new_hybrid() -> Self {
    Self::new(SfMethod::Hybrid)
  }

  /// Set the maximum number of full evolution iterations.
  pub fn set_max_iterations(mut self, max_iterations: usize) -> Self {
    self.params.max_iterations = max_iterations;
    self
  }

  /// Set the number of speed sub-iterations per full iteration.
  pub fn set_speed_iterations(mut self, speed_iterations: usize) -> Self {
    self.params.speed_iterations = speed_iterations;
    self
  }

  /// Set the number of smoothing sub-iterations per full iteration. Setting
  /// this to zero disables smoothing entirely (no kernel is built).
  pub fn set_smooth_iterations(mut self, smooth_iterations: usize) -> Self {
    self.params.smooth_iterations = smooth_iterations;
    self
  }

  /// Set the half-width of the Gaussian smoothing kernel. Note that the
  /// half-width may not be set higher than 7.
  pub fn set_gauss_width(mut self, gauss_width: usize) -> Self {
    self.params.gauss_width = gauss_width;
    self
  }

  /// Set the standard deviation of the Gaussian smoothing kernel.
  pub fn set_gauss_sigma(mut self, gauss_sigma: f64) -> Self {
    self.params.gauss_sigma = gauss_sigma;
    self
  }

  /// Set the half-edge of the statistics window of the hybrid speed field.
  pub fn set_neighbourhood_radius(mut self, neighbourhood_radius: usize) -> Self {
    self.hybrid.neighbourhood_radius = neighbourhood_radius;
    self
  }

  /// Set the soft intensity cut-off of the hybrid speed field. A value of 0
  /// leaves the image untouched.
  pub fn set_cutoff_intensity(mut self, cutoff_intensity: i32) -> Self {
    self.hybrid.cutoff_intensity = cutoff_intensity;
    self
  }

  /// Install a cooperative cancellation flag. The engine polls the flag
  /// after every speed and smoothing sub-iteration and returns
  /// [`LevelSetError::Cancelled`] promptly once it is raised.
  pub fn set_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
    self.cancel = Some(cancel);
    self
  }

  /// Build a [`FastLevelSet`] engine from the current builder configuration,
  /// seeded with `im` (the image to be segmented) and `init` (a binary
  /// initialisation mask of the same shape; non-zero means foreground).
  ///
  /// This function may return an `Err` result if the builder was not
  /// properly configured, or if the initialisation mask does not split the
  /// image into a non-empty inside and outside (region criterion only).
  pub fn build<'a>(
    self,
    im: nd::ArrayView2<'a, i32>,
    init: nd::ArrayView2<'_, u8>,
  ) -> Result<FastLevelSet<'a>, LevelSetError> {
    let speed_field = create_speed_field(self.method, im, init, &self.hybrid)?;
    let mut fls = FastLevelSet::new(self.params, im, init, speed_field)?;
    if let Some(cancel) = self.cancel {
      fls.set_cancel_flag(cancel);
    }
    Ok(fls)
  }
}

/// This trait contains useful functions for preparing images to be used as
/// input for a level-set segmentation
pub trait LevelSetUtils {
  /// The `pre_processor` function converts an array of any numeric data-type
  /// `T` into an array of `i32`, the intensity domain of the segmentation
  /// engine. Non-finite values (if `T` is a float type) are mapped to 0 and
  /// everything else is clamped into the `i32` range.
  fn pre_processor<T, D>(&self, img: nd::ArrayView<T, D>) -> nd::Array<i32, D>
  where
    T: Num + Copy + ToPrimitive + PartialOrd,
    D: nd::Dimension,
  {
    img.mapv(|x| -> i32 {
      let float = x.to_f64().unwrap_or(0.0);
      if float.is_finite() {
        float.clamp(i32::MIN as f64, i32::MAX as f64) as i32
      } else {
        0
      }
    })
  }
}

impl LevelSetUtils for SegmenterBuilder {}

////////////////////////////////////////////////////////////////////////////////
//                               SPEED FIELDS                                 //
////////////////////////////////////////////////////////////////////////////////

/// A per-point signed speed driving the boundary motion. This trait is
/// dyn-safe, which means that trait objects may be constructed from it.
///
/// Speed values follow the conventional definition in which a positive speed
/// contracts the boundary and a negative speed expands it. The evolution loop
/// only ever consumes the quantized, sign-flipped form produced by
/// [`SpeedField::compute_sign`] (see [`fls_sign`]), where +1 means "switch
/// this outside point in" and -1 means "switch this inside point out".
///
/// Fields that maintain statistics over the inside/outside partition are
/// notified of every boundary crossing through `notify_switch_in` /
/// `notify_switch_out` and fold the accumulated moves into their statistics
/// in `apply_pending_updates`, which the engine calls before the first speed
/// sub-iteration that follows a change. Stateless fields can rely on the
/// provided no-op defaults.
pub trait SpeedField {
  /// Compute the continuous speed at a single point (conventional sign).
  fn compute_speed(&self, phi: nd::ArrayView2<i8>, p: (usize, usize)) -> f64;

  /// Compute the quantized, engine-facing speed at a single point:
  /// one of -1, 0 or +1.
  fn compute_sign(&self, phi: nd::ArrayView2<i8>, p: (usize, usize)) -> i8 {
    fls_sign(self.compute_speed(phi, p))
  }

  /// Does this speed field need to fold accumulated boundary crossings into
  /// its statistics before the next sweep?
  fn requires_update(&self) -> bool {
    false
  }

  /// Notify the speed field that a point has moved from outside to inside.
  fn notify_switch_in(&mut self, _p: (usize, usize)) {}

  /// Notify the speed field that a point has moved from inside to outside.
  fn notify_switch_out(&mut self, _p: (usize, usize)) {}

  /// Fold the accumulated boundary crossings into the field statistics.
  fn apply_pending_updates(&mut self) {}
}

/// The global region speed field of Chan & Vese.
///
/// The continuous speed at `(x, y)` is
/// `(μ_in - μ_out)·(-2·I(x, y) + μ_in + μ_out)`, where `μ_in` and `μ_out`
/// are the mean intensities of the current inside and outside partition.
/// Points brighter than the midpoint of the two means are pulled inside
/// whenever the inside is the brighter region, and vice versa.
///
/// The partition sums are seeded from the initialisation mask at
/// construction time and maintained incrementally afterwards: boundary
/// crossings reported through the notify methods are queued and folded into
/// the areas and intensity totals by `apply_pending_updates`, so a speed
/// query never traverses the raster.
#[derive(Debug)]
pub struct ChanVeseSpeedField<'a> {
  /// The image
  im: nd::ArrayView2<'a, i32>,
  /// Total inside intensity
  t_in: i64,
  /// Total outside intensity
  t_out: i64,
  /// Inside area
  a_in: usize,
  /// Outside area
  a_out: usize,
  /// Sum of the partition means (inside + outside)
  sum: f64,
  /// Difference of the partition means (inside - outside)
  diff: f64,
  /// Points which have moved from inside to outside since the last update
  in2out: Vec<(usize, usize)>,
  /// Points which have moved from outside to inside since the last update
  out2in: Vec<(usize, usize)>,
}

impl<'a> ChanVeseSpeedField<'a> {
  /// Seed the partition statistics by traversing the initialisation mask.
  ///
  /// Returns [`LevelSetError::EmptyPartition`] if the mask is entirely
  /// foreground or entirely background, since the region means would be
  /// undefined.
  pub fn new(
    im: nd::ArrayView2<'a, i32>,
    init: nd::ArrayView2<'_, u8>,
  ) -> Result<Self, LevelSetError> {
    if init.dim() != im.dim() {
      return Err(LevelSetError::Config(format!(
        "initialisation mask shape {:?} does not match image shape {:?}",
        init.dim(),
        im.dim()
      )));
    }

    let mut field = ChanVeseSpeedField {
      im,
      t_in: 0,
      t_out: 0,
      a_in: 0,
      a_out: 0,
      sum: 0.0,
      diff: 0.0,
      in2out: Vec::new(),
      out2in: Vec::new(),
    };

    for ((y, x), &mask) in init.indexed_iter() {
      if mask > 0 {
        field.a_in += 1;
        field.t_in += field.im[[y, x]] as i64;
      } else {
        field.a_out += 1;
        field.t_out += field.im[[y, x]] as i64;
      }
    }

    if field.a_in == 0 || field.a_out == 0 {
      return Err(LevelSetError::EmptyPartition { inside: field.a_in, outside: field.a_out });
    }

    //This takes care of recalculating the mean sum and difference
    field.apply_pending_updates();
    Ok(field)
  }

  /// The current inside and outside pixel counts.
  pub fn areas(&self) -> (usize, usize) {
    (self.a_in, self.a_out)
  }

  /// The current inside and outside mean intensities, as of the last call to
  /// `apply_pending_updates`.
  pub fn means(&self) -> (f64, f64) {
    ((self.sum + self.diff) / 2.0, (self.sum - self.diff) / 2.0)
  }
}

impl SpeedField for ChanVeseSpeedField<'_> {
  fn compute_speed(&self, _phi: nd::ArrayView2<i8>, (x, y): (usize, usize)) -> f64 {
    // F = (I - u1)² - (I - u2)²
    //   = -2I(u1 - u2) + (u1 + u2)(u1 - u2)
    //   = (u1 - u2)(-2I + u1 + u2)
    self.diff * (-2.0 * self.im[[y, x]] as f64 + self.sum)
  }

  fn requires_update(&self) -> bool {
    !self.in2out.is_empty() || !self.out2in.is_empty()
  }

  fn notify_switch_in(&mut self, p: (usize, usize)) {
    debug_assert!(p.0 < self.im.ncols() && p.1 < self.im.nrows());
    self.out2in.push(p);
  }

  fn notify_switch_out(&mut self, p: (usize, usize)) {
    debug_assert!(p.0 < self.im.ncols() && p.1 < self.im.nrows());
    self.in2out.push(p);
  }

  fn apply_pending_updates(&mut self) {
    for &(x, y) in &self.in2out {
      self.a_in -= 1;
      self.a_out += 1;
      self.t_in -= self.im[[y, x]] as i64;
      self.t_out += self.im[[y, x]] as i64;
    }
    self.in2out.clear();

    for &(x, y) in &self.out2in {
      self.a_in += 1;
      self.a_out -= 1;
      self.t_in += self.im[[y, x]] as i64;
      self.t_out -= self.im[[y, x]] as i64;
    }
    self.out2in.clear();

    let mean_in = self.t_in as f64 / self.a_in as f64;
    let mean_out = self.t_out as f64 / self.a_out as f64;
    self.sum = mean_in + mean_out;
    self.diff = mean_in - mean_out;
  }
}

/// The local-region speed field of Lankton et al.
///
/// The Chan-Vese criterion is evaluated with means taken over the square
/// window `[x - r, x + r) × [y - r, y + r)` around each query point, clipped
/// to the raster and partitioned by the sign of the level-set function. The
/// field holds no cross-iteration state, so every query traverses its window
/// afresh.
///
/// When `cutoff_intensity` is positive the image is low-passed once at
/// construction time: every intensity `I` is replaced by
/// `I / √(1 + (I/c)²)`, truncated. This dampens very bright outliers while
/// leaving intensities below the cut-off almost untouched. The filter runs
/// on a private copy; the caller's raster is never modified.
///
/// If the window around a query point lies entirely on one side of the
/// boundary, one of the local means is undefined and the speed is reported
/// as 0 (no preference) rather than dividing by zero.
pub struct HybridSpeedField<'a> {
  /// Parameters for this speed field
  params: HybridParameters,
  /// The (optionally filtered) image
  filt: nd::CowArray<'a, i32, nd::Ix2>,
}

impl<'a> HybridSpeedField<'a> {
  /// Constructor. Applies the low-pass pre-filter if a positive cut-off
  /// intensity is configured.
  pub fn new(params: HybridParameters, im: nd::ArrayView2<'a, i32>) -> Self {
    let filt = if params.cutoff_intensity > 0 {
      let c = params.cutoff_intensity as f64;
      nd::CowArray::from(im.mapv(|v| {
        let tmp = v as f64 / c;
        (v as f64 / (1.0 + tmp * tmp).sqrt()) as i32
      }))
    } else {
      nd::CowArray::from(im)
    };
    HybridSpeedField { params, filt }
  }
}

impl SpeedField for HybridSpeedField<'_> {
  fn compute_speed(&self, phi: nd::ArrayView2<i8>, (x, y): (usize, usize)) -> f64 {
    let r = self.params.neighbourhood_radius;
    let (height, width) = self.filt.dim();
    let xmin = x.saturating_sub(r);
    let ymin = y.saturating_sub(r);
    let xmax = (x + r).min(width);
    let ymax = (y + r).min(height);

    let (mut area_in, mut area_out) = (0i64, 0i64);
    let (mut total_in, mut total_out) = (0i64, 0i64);
    for wy in ymin..ymax {
      for wx in xmin..xmax {
        let im = self.filt[[wy, wx]] as i64;
        if phi[[wy, wx]] < 0 {
          area_in += 1;
          total_in += im;
        } else {
          area_out += 1;
          total_out += im;
        }
      }
    }

    //A window entirely on one side has no usable statistics
    if area_in == 0 || area_out == 0 {
      return 0.0;
    }

    let mean_in = total_in as f64 / area_in as f64;
    let mean_out = total_out as f64 / area_out as f64;
    (mean_in - mean_out) * (-2.0 * self.filt[[y, x]] as f64 + mean_in + mean_out)
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                 OBSERVERS                                  //
////////////////////////////////////////////////////////////////////////////////

/// A passive callback which is notified of the completion of intermediate
/// iterations during the evolution. Counts are 1-based and paired with their
/// totals, so `full as f64 / full_total as f64` is the fractional completion.
///
/// Observers are invoked synchronously from the evolution loop; they must
/// return quickly and cannot mutate engine state.
pub trait IterationObserver {
  /// A full iteration (i.e. all speed and smooth sub-iterations) has
  /// completed.
  fn full_iteration(&mut self, full: usize, full_total: usize);

  /// A speed sub-iteration has completed.
  fn speed_iteration(&mut self, full: usize, full_total: usize, speed: usize, speed_total: usize) {
    let _ = (full, full_total, speed, speed_total);
  }

  /// A smoothing sub-iteration has completed.
  fn smooth_iteration(
    &mut self,
    full: usize,
    full_total: usize,
    smooth: usize,
    smooth_total: usize,
  ) {
    let _ = (full, full_total, smooth, smooth_total);
  }
}

/// A passive callback which is handed read-only views of the inner and outer
/// boundary lists after each intermediate iteration.
pub trait BoundaryObserver {
  /// A full iteration has completed.
  fn full_iteration(&mut self, lin: &[(usize, usize)], lout: &[(usize, usize)]);

  /// A speed sub-iteration has completed.
  fn speed_iteration(&mut self, lin: &[(usize, usize)], lout: &[(usize, usize)]) {
    let _ = (lin, lout);
  }

  /// A smoothing sub-iteration has completed.
  fn smooth_iteration(&mut self, lin: &[(usize, usize)], lout: &[(usize, usize)]) {
    let _ = (lin, lout);
  }
}

////////////////////////////////////////////////////////////////////////////////
//                             LEVEL-SET ENGINE                               //
////////////////////////////////////////////////////////////////////////////////

/// Identifiers for the two boundary lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListType {
  In,
  Out,
}

/// The fast two-cycle level-set evolution engine.
///
/// The engine owns the level-set grid, the two boundary lists, the Gaussian
/// smoothing kernel and the speed field; it borrows the image for the
/// duration of the segmentation. Every cell of the level-set grid is exactly
/// one of four values:
///
/// | value | meaning |
/// |---|---|
/// | -3 | strictly inside, away from the boundary |
/// | -1 | inner boundary layer (member of `lin`) |
/// | +1 | outer boundary layer (member of `lout`) |
/// | +3 | strictly outside, away from the boundary |
///
/// The -1/+1 cells mirror the two boundary lists at all times: switching a
/// point between the lists rewrites its grid cell in the same step, newly
/// exposed neighbours enter the opposite list, and a clean pass promotes
/// points whose neighbourhood has fully changed sides to ±3. Pending
/// additions gathered during a sweep are spliced at the front of the live
/// lists once the sweep completes, so a pass never visits points it created
/// itself.
///
/// # Memory usage
/// The engine allocates two byte grids of the image size (the level-set
/// function and the quantized speeds) plus the boundary lists, whose length
/// is proportional to the boundary circumference. One can count on the
/// memory usage being about ~2x the size of the input raster.
///
/// # Output
/// After a successful `segment()`, `segmentation()` renders the level-set
/// grid into a binary `u8` raster (255 where the level-set function is
/// negative, 0 elsewhere). On cancellation no output may be consumed.
pub struct FastLevelSet<'a> {
  /// Parameters of the evolution
  params: Parameters,
  /// Raster width (columns)
  width: usize,
  /// Raster height (rows)
  height: usize,
  /// The level-set function
  phi: nd::Array2<i8>,
  /// Quantized speeds of the latest sweep, boundary cells only
  speed: nd::Array2<i8>,
  /// Points on the inside of the boundary
  lin: Vec<(usize, usize)>,
  /// Points on the outside of the boundary
  lout: Vec<(usize, usize)>,
  /// Points to be added to `lin` when the current sweep completes
  add_lin: Vec<(usize, usize)>,
  /// Points to be added to `lout` when the current sweep completes
  add_lout: Vec<(usize, usize)>,
  /// The Gaussian smoothing kernel (empty when smoothing is disabled)
  gauss_filter: nd::Array2<u16>,
  /// Switch threshold of the smoothing cycle: half the kernel total
  gauss_filter_threshold: u32,
  /// The speed field driving the boundary motion
  speed_field: Box<dyn SpeedField + 'a>,
  /// Iteration observers, notified after each (sub-)iteration
  iteration_observers: Vec<Box<dyn IterationObserver + 'a>>,
  /// Boundary observers, handed the lists after each (sub-)iteration
  boundary_observers: Vec<Box<dyn BoundaryObserver + 'a>>,
  /// Cooperative cancellation flag, polled between sub-iterations
  cancel: Option<Arc<AtomicBool>>,
}

impl<'a> FastLevelSet<'a> {
  /// Constructor. Sets up the intermediate grids, seeds the level-set
  /// function from the initialisation mask and builds the Gaussian smoothing
  /// kernel (if smoothing is enabled).
  ///
  /// `im` and `init` must have the same, non-empty shape; `init` is
  /// interpreted as non-zero = foreground.
  pub fn new(
    params: Parameters,
    im: nd::ArrayView2<'a, i32>,
    init: nd::ArrayView2<'_, u8>,
    speed_field: Box<dyn SpeedField + 'a>,
  ) -> Result<Self, LevelSetError> {
    let (height, width) = im.dim();
    if width == 0 || height == 0 {
      return Err(LevelSetError::Config("the image must not be empty".to_string()));
    }
    if init.dim() != im.dim() {
      return Err(LevelSetError::Config(format!(
        "initialisation mask shape {:?} does not match image shape {:?}",
        init.dim(),
        im.dim()
      )));
    }

    let (gauss_filter, gauss_filter_threshold) = if params.smooth_iterations > 0 {
      if !(params.gauss_sigma > 0.0) {
        return Err(LevelSetError::Config(format!(
          "gauss_sigma must be positive when smoothing is enabled, got {}",
          params.gauss_sigma
        )));
      }
      create_gauss_filter(params.gauss_width, params.gauss_sigma)?
    } else {
      (nd::Array2::zeros((0, 0)), 0)
    };

    let mut fls = FastLevelSet {
      params,
      width,
      height,
      phi: nd::Array2::zeros((height, width)),
      speed: nd::Array2::zeros((height, width)),
      lin: Vec::new(),
      lout: Vec::new(),
      add_lin: Vec::new(),
      add_lout: Vec::new(),
      gauss_filter,
      gauss_filter_threshold,
      speed_field,
      iteration_observers: Vec::new(),
      boundary_observers: Vec::new(),
      cancel: None,
    };
    fls.initialise(init);
    Ok(fls)
  }

  /// Register an observer notified of iteration progress.
  pub fn add_iteration_observer<O: IterationObserver + 'a>(&mut self, observer: O) {
    self.iteration_observers.push(Box::new(observer));
  }

  /// Register an observer handed the boundary lists after each iteration.
  pub fn add_boundary_observer<O: BoundaryObserver + 'a>(&mut self, observer: O) {
    self.boundary_observers.push(Box::new(observer));
  }

  /// Install a cooperative cancellation flag (single writer, single reader).
  pub fn set_cancel_flag(&mut self, cancel: Arc<AtomicBool>) {
    self.cancel = Some(cancel);
  }

  /// Segment the image, subject to the maximum number of iterations.
  ///
  /// Returns `Ok(())` when the evolution converged or ran out of iterations,
  /// and `Err(`[`LevelSetError::Cancelled`]`)` when the cancellation flag
  /// was raised between sub-iterations. In the latter case the segmentation
  /// output must not be consumed.
  pub fn segment(&mut self) -> Result<(), LevelSetError> {
    let mut converged = false;

    info!(
      "speed_iterations:{} smooth_iterations:{} max_iterations:{} gauss_width:{} gauss_sigma:{}",
      self.params.speed_iterations,
      self.params.smooth_iterations,
      self.params.max_iterations,
      self.params.gauss_width,
      self.params.gauss_sigma
    );

    #[cfg(feature = "progress")]
    let bar = set_up_bar(self.params.max_iterations);

    #[cfg(feature = "debug")]
    let mut perf = performance_monitoring::PerfReport::default();
    #[cfg(feature = "debug")]
    let run_start = std::time::Instant::now();

    for n_its in 0..self.params.max_iterations {
      debug!("iteration: {}/{}", n_its + 1, self.params.max_iterations);

      for n_speed_its in 0..self.params.speed_iterations {
        debug!("\tspeed: [{}]{}/{}", n_its + 1, n_speed_its + 1, self.params.speed_iterations);

        #[cfg(feature = "debug")]
        let sweep_start = std::time::Instant::now();

        self.evolve_speed();

        #[cfg(feature = "debug")]
        {
          perf.speed_sweep_ms.push(sweep_start.elapsed().as_millis() as usize);
          self.assert_consistent();
        }

        self.notify_speed_iteration(n_its, n_speed_its);

        converged = self.has_converged();
        if converged {
          if n_its == 0 {
            //Always do at least two iterations
            debug!("converged on iteration [1]{}, ignoring", n_speed_its + 1);
            converged = false;
            //Always break because the boundary is stuck in place
          } else {
            debug!("converged on iteration [{}]{}", n_its + 1, n_speed_its + 1);
          }
          break;
        }

        if self.cancelled() {
          info!("cancellation requested, terminating");
          return Err(LevelSetError::Cancelled);
        }
      }

      for n_smooth_its in 0..self.params.smooth_iterations {
        debug!("\tsmooth: [{}]{}/{}", n_its + 1, n_smooth_its + 1, self.params.smooth_iterations);

        #[cfg(feature = "debug")]
        let sweep_start = std::time::Instant::now();

        self.evolve_smooth();

        #[cfg(feature = "debug")]
        {
          perf.smooth_sweep_ms.push(sweep_start.elapsed().as_millis() as usize);
          self.assert_consistent();
        }

        self.notify_smooth_iteration(n_its, n_smooth_its);

        if self.cancelled() {
          info!("cancellation requested, terminating");
          return Err(LevelSetError::Cancelled);
        }
      }

      self.notify_full_iteration(n_its);

      #[cfg(feature = "debug")]
      {
        perf.iterations += 1;
      }
      #[cfg(feature = "progress")]
      {
        bar.inc(1);
      }

      if converged {
        break;
      }
    }

    #[cfg(feature = "debug")]
    {
      perf.total_ms = run_start.elapsed().as_millis() as usize;
      println!("{perf}");
    }

    Ok(())
  }

  /// Renders the level-set grid into a binary segmentation: 255 where the
  /// level-set function is negative (foreground), 0 elsewhere.
  pub fn segmentation(&self) -> nd::Array2<u8> {
    nd::Array2::from_shape_fn((self.height, self.width), |(y, x)| {
      if self.phi[[y, x]] < 0 {
        255
      } else {
        0
      }
    })
  }

  /// A read-only view of the level-set function.
  pub fn phi(&self) -> nd::ArrayView2<'_, i8> {
    self.phi.view()
  }

  /// The current inner boundary points.
  pub fn lin(&self) -> &[(usize, usize)] {
    &self.lin
  }

  /// The current outer boundary points.
  pub fn lout(&self) -> &[(usize, usize)] {
    &self.lout
  }

  /// Verify that the boundary lists and the level-set grid agree:
  /// no duplicates within either list, no point in both, every `lin` point
  /// at -1 and every `lout` point at +1, and every remaining cell at ±3.
  ///
  /// With the `debug` feature enabled this check runs automatically after
  /// every sweep and panics on the first violation.
  pub fn check_consistency(&self) -> Result<(), LevelSetError> {
    use std::collections::HashSet;

    let mut error_msg = String::new();
    let set_lin: HashSet<(usize, usize)> = self.lin.iter().copied().collect();
    let set_lout: HashSet<(usize, usize)> = self.lout.iter().copied().collect();

    if set_lin.len() != self.lin.len() {
      error_msg += &format!("Lin contains {} duplicate(s). ", self.lin.len() - set_lin.len());
    }
    if set_lout.len() != self.lout.len() {
      error_msg += &format!("Lout contains {} duplicate(s). ", self.lout.len() - set_lout.len());
    }

    let overlap = set_lin.intersection(&set_lout).count();
    if overlap > 0 {
      error_msg += &format!("{overlap} point(s) found in both Lin and Lout. ");
    }

    //Don't bother checking further if there's already an error
    if !error_msg.is_empty() {
      return Err(LevelSetError::Inconsistent(error_msg));
    }

    //Check that the grid agrees with the two lists
    let mut checked = nd::Array2::<u8>::zeros((self.height, self.width));

    for &(x, y) in &self.lin {
      if self.phi[[y, x]] == -1 {
        checked[[y, x]] = 1;
      } else {
        error_msg += &format!("Lin({x},{y}): phi={}. ", self.phi[[y, x]]);
      }
    }

    for &(x, y) in &self.lout {
      if self.phi[[y, x]] == 1 {
        checked[[y, x]] = 1;
      } else {
        error_msg += &format!("Lout({x},{y}): phi={}. ", self.phi[[y, x]]);
      }
    }

    //Now check that the remaining regions are either 3 or -3
    for y in 0..self.height {
      for x in 0..self.width {
        if self.phi[[y, x]] == 3 || self.phi[[y, x]] == -3 {
          checked[[y, x]] = 1;
        } else if checked[[y, x]] == 0 {
          error_msg += &format!("phi({x},{y})={}. ", self.phi[[y, x]]);
        }
      }
    }

    if error_msg.is_empty() {
      Ok(())
    } else {
      Err(LevelSetError::Inconsistent(error_msg))
    }
  }

  /// Initialise the level-set function from the binary mask: every
  /// foreground pixel enters the inner list at -1, every background pixel
  /// the outer list at +1. The subsequent clean passes push everything away
  /// from the boundary to ±3.
  fn initialise(&mut self, init: nd::ArrayView2<'_, u8>) {
    for y in 0..self.height {
      for x in 0..self.width {
        if init[[y, x]] > 0 {
          self.add_to_list((x, y), ListType::In);
        } else {
          self.add_to_list((x, y), ListType::Out);
        }
      }
    }

    self.flush_list_additions();
    self.clean_lin();
    self.clean_lout();

    #[cfg(feature = "debug")]
    self.assert_consistent();
  }

  /// Evolve once according to the image speed field.
  fn evolve_speed(&mut self) {
    /* Whenever a point is switched, its quantized speed is set to the
      opposite of the convergence criterion, so a convergence test over the
      speed grid can never succeed in a sweep that moved the boundary. The
      real speeds at those points are recalculated on the next sweep.
    */
    if self.speed_field.requires_update() {
      self.speed_field.apply_pending_updates();
    }

    //(1) outer -> inner transitions
    let lout = std::mem::take(&mut self.lout);
    let mut kept = Vec::with_capacity(lout.len());
    for p in lout {
      if self.calculate_speed(p) > 0 {
        self.switch_in(p);
      } else {
        kept.push(p);
      }
    }
    self.lout = kept;

    self.flush_list_additions();
    self.clean_lin();

    //(2) inner -> outer transitions
    let lin = std::mem::take(&mut self.lin);
    let mut kept = Vec::with_capacity(lin.len());
    for p in lin {
      if self.calculate_speed(p) < 0 {
        self.switch_out(p);
      } else {
        kept.push(p);
      }
    }
    self.lin = kept;

    self.flush_list_additions();
    self.clean_lout();
  }

  /// Evolve once according to the smoothing field.
  fn evolve_smooth(&mut self) {
    //(1) outer -> inner transitions
    let lout = std::mem::take(&mut self.lout);
    let mut kept = Vec::with_capacity(lout.len());
    for p in lout {
      if self.calculate_smooth(p) > self.gauss_filter_threshold {
        self.switch_in(p);
      } else {
        kept.push(p);
      }
    }
    self.lout = kept;

    self.flush_list_additions();
    self.clean_lin();

    //(2) inner -> outer transitions
    let lin = std::mem::take(&mut self.lin);
    let mut kept = Vec::with_capacity(lin.len());
    for p in lin {
      if self.calculate_smooth(p) < self.gauss_filter_threshold {
        self.switch_out(p);
      } else {
        kept.push(p);
      }
    }
    self.lin = kept;

    self.flush_list_additions();
    self.clean_lout();
  }

  /// Calculate the quantized speed at a point and store it in the speed
  /// grid.
  fn calculate_speed(&mut self, (x, y): (usize, usize)) -> i8 {
    let sign = self.speed_field.compute_sign(self.phi.view(), (x, y));
    debug_assert!((-1..=1).contains(&sign));
    self.speed[[y, x]] = sign;
    sign
  }

  /// Convolve the inside indicator with the Gaussian kernel at a point.
  fn calculate_smooth(&self, (x, y): (usize, usize)) -> u32 {
    let gw = self.params.gauss_width as isize;
    let (x, y) = (x as isize, y as isize);
    let dxmin = (-gw).max(-x);
    let dymin = (-gw).max(-y);
    let dxmax = (gw + 1).min(self.width as isize - x);
    let dymax = (gw + 1).min(self.height as isize - y);

    let mut f = 0u32;
    for dy in dymin..dymax {
      for dx in dxmin..dxmax {
        // conv(G, phi < 0)
        if self.phi[[(y + dy) as usize, (x + dx) as usize]] < 0 {
          f += self.gauss_filter[[(gw + dy) as usize, (gw + dx) as usize]] as u32;
        }
      }
    }
    f
  }

  /// Has the level set converged? True iff no inner point wants to leave
  /// and no outer point wants to enter, judged by the speed grid of the
  /// latest sweep. Since switching a point deliberately writes the
  /// anti-converged speed, any sweep that moved the boundary reports
  /// non-convergence without recalculating the speed field.
  fn has_converged(&self) -> bool {
    // Convergence: speed(lin) >= 0, speed(lout) <= 0
    self.lin.iter().all(|&(x, y)| self.speed[[y, x]] >= 0)
      && self.lout.iter().all(|&(x, y)| self.speed[[y, x]] <= 0)
  }

  /// Stage a point for one of the boundary lists and write its grid value.
  fn add_to_list(&mut self, (x, y): (usize, usize), ln: ListType) {
    match ln {
      ListType::In => {
        self.add_lin.push((x, y));
        self.phi[[y, x]] = -1;
      }
      ListType::Out => {
        self.add_lout.push((x, y));
        self.phi[[y, x]] = 1;
      }
    }
  }

  /// Move an outer boundary point inside. The caller removes `p` from the
  /// live outer list; this stages it for `lin`, exposes its far-outside
  /// neighbours to `lout` and writes anti-converged speeds at every touched
  /// point. `flush_list_additions` must run before the next pass.
  fn switch_in(&mut self, p: (usize, usize)) {
    self.speed_field.notify_switch_in(p);

    self.add_to_list(p, ListType::In);
    self.speed[[p.1, p.0]] = -1;

    for q in neighbours_4con(p, self.width, self.height) {
      if self.phi[[q.1, q.0]] == 3 {
        self.add_to_list(q, ListType::Out);
        self.speed[[q.1, q.0]] = 1;
      }
    }
  }

  /// Move an inner boundary point outside; the mirror image of `switch_in`.
  fn switch_out(&mut self, p: (usize, usize)) {
    self.speed_field.notify_switch_out(p);

    self.add_to_list(p, ListType::Out);
    self.speed[[p.1, p.0]] = 1;

    for q in neighbours_4con(p, self.width, self.height) {
      if self.phi[[q.1, q.0]] == -3 {
        self.add_to_list(q, ListType::In);
        self.speed[[q.1, q.0]] = -1;
      }
    }
  }

  /// Splice any pending additions into the front of the appropriate lists,
  /// so the next pass encounters the newest points first.
  fn flush_list_additions(&mut self) {
    let add_lin = std::mem::take(&mut self.add_lin);
    self.lin.splice(0..0, add_lin);
    let add_lout = std::mem::take(&mut self.add_lout);
    self.lout.splice(0..0, add_lout);
  }

  /// Remove inner points whose neighbourhood has moved fully inside,
  /// promoting them to -3.
  fn clean_lin(&mut self) {
    let lin = std::mem::take(&mut self.lin);
    let mut kept = Vec::with_capacity(lin.len());
    for p in lin {
      let all_inside =
        neighbours_4con(p, self.width, self.height).iter().all(|&(x, y)| self.phi[[y, x]] <= 0);
      if all_inside {
        self.phi[[p.1, p.0]] = -3;
      } else {
        kept.push(p);
      }
    }
    self.lin = kept;
  }

  /// Remove outer points whose neighbourhood has moved fully outside,
  /// promoting them to +3.
  fn clean_lout(&mut self) {
    let lout = std::mem::take(&mut self.lout);
    let mut kept = Vec::with_capacity(lout.len());
    for p in lout {
      let all_outside =
        neighbours_4con(p, self.width, self.height).iter().all(|&(x, y)| self.phi[[y, x]] >= 0);
      if all_outside {
        self.phi[[p.1, p.0]] = 3;
      } else {
        kept.push(p);
      }
    }
    self.lout = kept;
  }

  fn cancelled(&self) -> bool {
    self.cancel.as_ref().map_or(false, |flag| flag.load(Ordering::Relaxed))
  }

  fn notify_speed_iteration(&mut self, n_its: usize, n_speed_its: usize) {
    let (full_total, speed_total) = (self.params.max_iterations, self.params.speed_iterations);
    for observer in &mut self.iteration_observers {
      observer.speed_iteration(n_its + 1, full_total, n_speed_its + 1, speed_total);
    }
    let (lin, lout) = (&self.lin, &self.lout);
    for observer in &mut self.boundary_observers {
      observer.speed_iteration(lin, lout);
    }
  }

  fn notify_smooth_iteration(&mut self, n_its: usize, n_smooth_its: usize) {
    let (full_total, smooth_total) = (self.params.max_iterations, self.params.smooth_iterations);
    for observer in &mut self.iteration_observers {
      observer.smooth_iteration(n_its + 1, full_total, n_smooth_its + 1, smooth_total);
    }
    let (lin, lout) = (&self.lin, &self.lout);
    for observer in &mut self.boundary_observers {
      observer.smooth_iteration(lin, lout);
    }
  }

  fn notify_full_iteration(&mut self, n_its: usize) {
    let full_total = self.params.max_iterations;
    for observer in &mut self.iteration_observers {
      observer.full_iteration(n_its + 1, full_total);
    }
    let (lin, lout) = (&self.lin, &self.lout);
    for observer in &mut self.boundary_observers {
      observer.full_iteration(lin, lout);
    }
  }

  #[cfg(feature = "debug")]
  fn assert_consistent(&self) {
    if let Err(err) = self.check_consistency() {
      panic!("{err}");
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                   TESTS                                    //
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn neighbourhood_respects_bounds() {
    //Interior point: all four neighbours
    let nh = neighbours_4con((2, 2), 5, 5);
    assert_eq!(nh.len(), 4);
    for q in [(3, 2), (2, 3), (2, 1), (1, 2)] {
      assert!(nh.contains(&q));
    }

    //Corners: two neighbours
    let nh = neighbours_4con((0, 0), 5, 5);
    assert_eq!(nh.len(), 2);
    assert!(nh.contains(&(1, 0)) && nh.contains(&(0, 1)));
    let nh = neighbours_4con((4, 4), 5, 5);
    assert_eq!(nh.len(), 2);
    assert!(nh.contains(&(3, 4)) && nh.contains(&(4, 3)));

    //Edge midpoint: three neighbours
    let nh = neighbours_4con((0, 2), 5, 5);
    assert_eq!(nh.len(), 3);
    for q in [(1, 2), (0, 1), (0, 3)] {
      assert!(nh.contains(&q));
    }
  }

  #[test]
  fn sign_quantization_flips_and_clamps() {
    assert_eq!(fls_sign(123.4), -1);
    assert_eq!(fls_sign(1e-12), -1);
    assert_eq!(fls_sign(-0.5), 1);
    assert_eq!(fls_sign(0.0), 0);
    assert_eq!(fls_sign(f64::NAN), 0);
  }

  #[test]
  fn gauss_filter_is_symmetric_and_halved() {
    let (filter, threshold) = create_gauss_filter(3, 3.0).unwrap();
    assert_eq!(filter.dim(), (7, 7));

    //The centre carries the largest weight and the kernel is symmetric
    let centre = filter[[3, 3]];
    for y in 0..7 {
      for x in 0..7 {
        assert!(filter[[y, x]] <= centre);
        assert_eq!(filter[[y, x]], filter[[6 - y, 6 - x]]);
        assert_eq!(filter[[y, x]], filter[[x, y]]);
      }
    }

    let total: u32 = filter.iter().map(|&w| w as u32).sum();
    assert_eq!(threshold, total / 2);
  }

  #[test]
  fn gauss_filter_single_cell_is_identity() {
    //g = 0: a single cell with weight trunc(1/sigma²) and threshold 0
    let (filter, threshold) = create_gauss_filter(0, 1.0).unwrap();
    assert_eq!(filter.dim(), (1, 1));
    assert_eq!(filter[[0, 0]], 1);
    assert_eq!(threshold, 0);

    let (filter, threshold) = create_gauss_filter(0, 3.0).unwrap();
    assert_eq!(filter[[0, 0]], 0);
    assert_eq!(threshold, 0);
  }

  #[test]
  fn gauss_filter_rejects_oversized_kernels() {
    //g = 7 gives a 15x15 kernel (pre-scale 225), the largest admissible
    assert!(create_gauss_filter(7, 3.0).is_ok());
    match create_gauss_filter(8, 3.0) {
      Err(LevelSetError::Config(_)) => (),
      other => panic!("expected a configuration error, got {other:?}"),
    }
  }

  #[test]
  fn chan_vese_seeds_statistics_from_mask() {
    let im = nd::array![[10, 10, 10], [10, 40, 40], [10, 40, 40]];
    let mut init = nd::Array2::<u8>::zeros((3, 3));
    init[[1, 1]] = 255;
    init[[1, 2]] = 255;
    init[[2, 1]] = 255;
    init[[2, 2]] = 255;

    let field = ChanVeseSpeedField::new(im.view(), init.view()).unwrap();
    assert_eq!(field.areas(), (4, 5));
    let (mean_in, mean_out) = field.means();
    assert!((mean_in - 40.0).abs() < 1e-9);
    assert!((mean_out - 10.0).abs() < 1e-9);
  }

  #[test]
  fn chan_vese_rejects_degenerate_masks() {
    let im = nd::Array2::<i32>::from_elem((4, 4), 7);
    let empty = nd::Array2::<u8>::zeros((4, 4));
    match ChanVeseSpeedField::new(im.view(), empty.view()) {
      Err(LevelSetError::EmptyPartition { inside: 0, outside: 16 }) => (),
      other => panic!("expected an empty partition error, got {other:?}"),
    }

    let full = nd::Array2::<u8>::from_elem((4, 4), 255);
    match ChanVeseSpeedField::new(im.view(), full.view()) {
      Err(LevelSetError::EmptyPartition { inside: 16, outside: 0 }) => (),
      other => panic!("expected an empty partition error, got {other:?}"),
    }
  }

  #[test]
  fn hybrid_one_sided_window_has_no_preference() {
    let im = nd::Array2::<i32>::from_elem((6, 6), 100);
    let params = HybridParameters { neighbourhood_radius: 2, cutoff_intensity: 0 };
    let field = HybridSpeedField::new(params, im.view());

    //Everything inside: neither local mean is defined
    let phi = nd::Array2::<i8>::from_elem((6, 6), -3);
    assert_eq!(field.compute_sign(phi.view(), (3, 3)), 0);

    //Everything outside
    let phi = nd::Array2::<i8>::from_elem((6, 6), 3);
    assert_eq!(field.compute_sign(phi.view(), (3, 3)), 0);
  }

  #[test]
  fn hybrid_cutoff_dampens_bright_pixels() {
    let im = nd::array![[50, 100, 400]];
    let params = HybridParameters { neighbourhood_radius: 1, cutoff_intensity: 100 };
    let field = HybridSpeedField::new(params, im.view());

    //I / sqrt(1 + (I/c)²), truncated
    assert_eq!(field.filt[[0, 0]], 44); // 50/sqrt(1.25)  = 44.7
    assert_eq!(field.filt[[0, 1]], 70); // 100/sqrt(2)    = 70.7
    assert_eq!(field.filt[[0, 2]], 97); // 400/sqrt(17)   = 97.0
  }

  #[test]
  fn initialisation_builds_two_pixel_band() {
    let im = nd::Array2::<i32>::from_elem((5, 5), 1);
    let mut init = nd::Array2::<u8>::zeros((5, 5));
    //3x3 foreground block
    for y in 1..4 {
      for x in 1..4 {
        init[[y, x]] = 255;
      }
    }

    let field = Box::new(HybridSpeedField::new(HybridParameters::default(), im.view()));
    let params = Parameters { smooth_iterations: 0, ..Parameters::default() };
    let fls = FastLevelSet::new(params, im.view(), init.view(), field).unwrap();
    fls.check_consistency().unwrap();

    //The block centre is far-inside, the rest of the block is the inner
    //boundary
    assert_eq!(fls.phi()[[2, 2]], -3);
    for (x, y) in [(1, 1), (2, 1), (3, 1), (1, 2), (3, 2), (1, 3), (2, 3), (3, 3)] {
      assert_eq!(fls.phi()[[y, x]], -1);
    }
    assert_eq!(fls.lin().len(), 8);

    //The ring around the block is the outer boundary, raster corners are
    //far-outside
    for (x, y) in [(1, 0), (2, 0), (3, 0), (0, 2), (4, 2), (2, 4)] {
      assert_eq!(fls.phi()[[y, x]], 1);
    }
    assert_eq!(fls.lout().len(), 12);
    assert_eq!(fls.phi()[[0, 0]], 3);
    assert_eq!(fls.phi()[[4, 4]], 3);
  }
}
