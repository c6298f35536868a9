/// Decoded pixel data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub data: Vec<u8>,
}

impl Raster {
    pub fn new(width: u32, height: u32, components: u8, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            components,
            data,
        }
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.components as usize
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && (1..=4).contains(&self.components)
            && self.data.len() >= self.expected_len()
    }

    /// Downscale by powers of two until both sides fit in `max_side`.
    ///
    /// Returns the scaled raster and the number of halvings applied.
    pub fn scaled_to_fit(&self, max_side: u32) -> (Raster, u32) {
        let mut halvings = 0;
        while (self.width >> halvings) > max_side || (self.height >> halvings) > max_side {
            halvings += 1;
        }
        if halvings == 0 {
            return (self.clone(), 0);
        }

        let step = 1usize << halvings;
        let width = (self.width >> halvings).max(1);
        let height = (self.height >> halvings).max(1);
        let components = self.components as usize;
        let row_len = self.width as usize * components;

        let mut data = Vec::with_capacity(width as usize * height as usize * components);
        for y in 0..height as usize {
            let row = y * step * row_len;
            for x in 0..width as usize {
                let start = row + x * step * components;
                data.extend_from_slice(&self.data[start..start + components]);
            }
        }

        (Raster::new(width, height, self.components, data), halvings)
    }
}
