//! Packing multi-channel tensors into a single 2-D grid image and back
//!
//! Channel `k` lands in tile `(k / tile_cols, k % tile_cols)`. Slots past the
//! last channel are filled with a caller-supplied value and are dropped again
//! by [`detile`].

use crate::layout::{TensorLayout, TiledArrayLayout};
use crate::tensor::{Element, Tensor};
use rayon::prelude::*;
use splitinfer_common::{Result, SplitInferError};

/// Lay the channels of `tensor` out on a `(grid_height, grid_width)` grid
pub fn tile<T: Element>(
    tensor: &Tensor<T>,
    layout: &TensorLayout,
    tiled: &TiledArrayLayout,
    fill: T,
) -> Result<Tensor<T>> {
    check_geometry(layout, tiled)?;
    if tensor.shape != layout.shape() {
        return Err(SplitInferError::tensor(format!(
            "tensor shape {:?} does not match layout {}",
            tensor.shape, layout
        )));
    }

    let grid_width = tiled.grid_width();
    let mut grid = vec![fill; tiled.grid_height() * grid_width];

    grid.par_chunks_mut(grid_width)
        .enumerate()
        .for_each(|(row, line)| {
            let tile_row = row / tiled.tile_height;
            let y = row % tiled.tile_height;
            for tile_col in 0..tiled.tile_cols {
                let k = tile_row * tiled.tile_cols + tile_col;
                if k >= layout.channels {
                    break;
                }
                let base = tile_col * tiled.tile_width;
                for x in 0..tiled.tile_width {
                    line[base + x] = tensor.data[layout.index(k, y, x)];
                }
            }
        });

    Ok(Tensor {
        data: grid,
        shape: vec![tiled.grid_height(), grid_width],
    })
}

/// Read the first `layout.channels` tiles of `grid` back into a tensor
pub fn detile<T: Element>(
    grid: &Tensor<T>,
    tiled: &TiledArrayLayout,
    layout: &TensorLayout,
) -> Result<Tensor<T>> {
    check_geometry(layout, tiled)?;
    let expected = [tiled.grid_height(), tiled.grid_width()];
    if grid.shape[..] != expected[..] {
        return Err(SplitInferError::codec(format!(
            "grid shape {:?} does not match tiled layout {:?}",
            grid.shape, expected
        )));
    }

    let grid_width = tiled.grid_width();
    let mut data = vec![T::default(); layout.element_count()];
    for k in 0..layout.channels {
        let (tile_row, tile_col) = tiled.tile_of(k);
        for y in 0..layout.height {
            let row = tile_row * tiled.tile_height + y;
            let start = row * grid_width + tile_col * tiled.tile_width;
            let src = &grid.data[start..start + layout.width];
            for (x, &v) in src.iter().enumerate() {
                data[layout.index(k, y, x)] = v;
            }
        }
    }

    Ok(Tensor {
        data,
        shape: layout.shape(),
    })
}

fn check_geometry(layout: &TensorLayout, tiled: &TiledArrayLayout) -> Result<()> {
    if tiled.slots() < layout.channels
        || tiled.tile_height != layout.height
        || tiled.tile_width != layout.width
    {
        return Err(SplitInferError::tensor(format!(
            "tiled layout {:?} cannot hold {}",
            tiled, layout
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{determine_tile_layout, AxisOrder};
    use crate::tensor::DType;
    use proptest::prelude::*;

    #[test]
    fn test_tile_places_channels_row_major() {
        // 5 channels of 1x2 -> 3x2 grid of tiles, one padding slot
        let layout = TensorLayout::new(5, 1, 2, DType::U8, AxisOrder::Chw).unwrap();
        let tiled = determine_tile_layout(&layout);
        assert_eq!((tiled.tile_rows, tiled.tile_cols), (3, 2));

        let tensor = Tensor::new((0u8..10).collect(), layout.shape()).unwrap();
        let grid = tile(&tensor, &layout, &tiled, 255).unwrap();

        assert_eq!(grid.shape, vec![3, 4]);
        assert_eq!(
            grid.data,
            vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 255, 255]
        );
    }

    #[test]
    fn test_detile_rejects_wrong_grid() {
        let layout = TensorLayout::new(4, 2, 2, DType::U8, AxisOrder::Hwc).unwrap();
        let tiled = determine_tile_layout(&layout);
        let grid = Tensor::new(vec![0u8; 20], vec![4, 5]).unwrap();
        assert!(detile(&grid, &tiled, &layout).is_err());
    }

    proptest! {
        #[test]
        fn prop_detile_inverts_tile(
            channels in 1usize..40,
            height in 1usize..6,
            width in 1usize..6,
            chw in any::<bool>(),
            fill in any::<u8>(),
            seed in any::<u64>(),
        ) {
            let order = if chw { AxisOrder::Chw } else { AxisOrder::Hwc };
            let layout = TensorLayout::new(channels, height, width, DType::U8, order).unwrap();
            let tiled = determine_tile_layout(&layout);

            let data = (0..layout.element_count())
                .map(|i| (seed.wrapping_mul(i as u64 + 1) >> 7) as u8)
                .collect();
            let tensor = Tensor::new(data, layout.shape()).unwrap();

            let grid = tile(&tensor, &layout, &tiled, fill).unwrap();
            prop_assert_eq!(detile(&grid, &tiled, &layout).unwrap(), tensor);
        }
    }
}
