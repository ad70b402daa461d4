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

use ndarray as nd;
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use rustronomy_levelset::prelude::*;

#[test]
fn core_bench() {
  //Create noisy backgrounds with a bright block in the middle
  let sizes = [128usize, 256, 512];

  let results: Vec<(usize, f64)> = sizes
    .into_iter()
    .map(|size| {
      let mut img = nd::Array2::<u8>::random((size, size), Uniform::new(0, 60)).mapv(|v| v as i32);
      let block = size / 4..3 * size / 4;
      img.slice_mut(nd::s![block.clone(), block.clone()]).mapv_inplace(|v| v + 180);

      //Seed with a small square in the centre of the block
      let mut init = nd::Array2::<u8>::zeros((size, size));
      let seed = size / 2 - 2..size / 2 + 2;
      init.slice_mut(nd::s![seed.clone(), seed.clone()]).fill(255);

      //Time the segmentation
      let mut ls = SegmenterBuilder::new_chan_vese()
        .set_max_iterations(50)
        .build(img.view(), init.view())
        .unwrap();
      let start = std::time::Instant::now();
      ls.segment().unwrap();
      let elapsed = start.elapsed().as_secs_f64();

      //The block should be (mostly) recovered
      let foreground = ls.segmentation().iter().filter(|&&px| px > 0).count();
      assert!(foreground > (size * size) / 8, "recovered only {foreground} px at size {size}");

      (size, elapsed)
    })
    .collect();

  //Print per run results
  for (size, time) in &results {
    println!("{size:4}x{size:<4} = {time:000.03}s");
  }

  //Print total results
  let average = (1.0 / (results.len() as f64)) * results.iter().map(|(_, t)| t).sum::<f64>();
  println!("Average time: {average:.03}");
}
