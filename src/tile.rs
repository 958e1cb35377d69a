use ndarray::Array2;

use crate::error::{MergeError, Result};

/// One square tile of the grid. All coordinates are in full resolution pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub index: usize,
    pub col: usize,
    pub row: usize,
    pub x: usize,
    pub y: usize,
    pub size: usize,
}

/// Overlapping tile layout shared by alignment and merging.
///
/// Tile origins advance by `tile_size - overlap` along each axis. The last origin is pulled
/// back to `extent - tile_size` so no tile reaches outside the frame; a frame smaller than one
/// tile gets a single tile at the origin whose out-of-frame samples are edge padded.
///
/// Tile sides on the frame border keep a flat window, so the summed window never drops below
/// the interior crossover and border pixels are not divided by a vanishing weight.
#[derive(Debug, Clone)]
pub struct TileGrid {
    width: usize,
    height: usize,
    tile_size: usize,
    overlap: usize,
    xs: Vec<usize>,
    ys: Vec<usize>,
    window: Vec<f32>,
}

impl TileGrid {
    pub fn new(width: usize, height: usize, tile_size: usize, overlap: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(MergeError::EmptyFrame);
        }

        if tile_size < 2 {
            return Err(MergeError::InvalidConfig(format!(
                "tile size {tile_size} is too small"
            )));
        }

        if overlap > tile_size / 2 {
            return Err(MergeError::InvalidConfig(format!(
                "tile overlap {overlap} exceeds half the tile size {tile_size}"
            )));
        }

        let stride = tile_size - overlap;

        Ok(Self {
            width,
            height,
            tile_size,
            overlap,
            xs: origins(width, tile_size, stride),
            ys: origins(height, tile_size, stride),
            window: window_1d(tile_size, overlap),
        })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    #[inline]
    pub fn overlap(&self) -> usize {
        self.overlap
    }

    #[inline]
    pub fn n_tiles_x(&self) -> usize {
        self.xs.len()
    }

    #[inline]
    pub fn n_tiles_y(&self) -> usize {
        self.ys.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.xs.len() * self.ys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tile(&self, index: usize) -> Tile {
        let col = index % self.xs.len();
        let row = index / self.xs.len();

        Tile {
            index,
            col,
            row,
            x: self.xs[col],
            y: self.ys[row],
            size: self.tile_size,
        }
    }

    /// Index of the tile at grid position `(col, row)`, if it exists.
    pub fn index_of(&self, col: isize, row: isize) -> Option<usize> {
        if col < 0 || row < 0 || col as usize >= self.xs.len() || row as usize >= self.ys.len() {
            return None;
        }

        Some(row as usize * self.xs.len() + col as usize)
    }

    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        (0..self.len()).map(|index| self.tile(index))
    }

    /// Separable window, one axis.
    #[inline]
    pub fn window_1d(&self) -> &[f32] {
        &self.window
    }

    /// Window value at tile-local `(x, y)` of an interior tile.
    #[inline]
    pub fn window(&self, x: usize, y: usize) -> f32 {
        self.window[x] * self.window[y]
    }

    /// Horizontal and vertical window of `tile`, untapered on sides touching the frame border.
    pub fn window_axes(&self, tile: &Tile) -> (Vec<f32>, Vec<f32>) {
        (
            self.border_window(tile.x, self.width),
            self.border_window(tile.y, self.height),
        )
    }

    /// `(row, col)` window of `tile`.
    pub fn tile_window(&self, tile: &Tile) -> Array2<f32> {
        let (wx, wy) = self.window_axes(tile);
        Array2::from_shape_fn((tile.size, tile.size), |(y, x)| wy[y] * wx[x])
    }

    fn border_window(&self, origin: usize, extent: usize) -> Vec<f32> {
        let mut window = self.window.clone();
        let taper = self.overlap.min(self.tile_size);

        if origin == 0 {
            window[..taper].fill(1.0);
        }

        if origin + self.tile_size >= extent {
            window[self.tile_size - taper..].fill(1.0);
        }

        window
    }
}

fn origins(extent: usize, tile_size: usize, stride: usize) -> Vec<usize> {
    if extent <= tile_size {
        return vec![0];
    }

    let last = extent - tile_size;
    let mut origins: Vec<usize> = (0..).map(|k| k * stride).take_while(|&o| o < last).collect();
    origins.push(last);
    origins
}

/// Raised-cosine taper over the `overlap` outermost samples on each side, flat in between.
///
/// Samples sit at half-integer positions, so the window never reaches zero and every
/// covered pixel keeps a positive weight.
fn window_1d(tile_size: usize, overlap: usize) -> Vec<f32> {
    (0..tile_size)
        .map(|i| {
            let edge = i.min(tile_size - 1 - i) as f32 + 0.5;
            if edge < overlap as f32 {
                0.5 - 0.5 * (std::f32::consts::PI * edge / overlap as f32).cos()
            } else {
                1.0
            }
        })
        .collect()
}
