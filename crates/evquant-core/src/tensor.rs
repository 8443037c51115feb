//! Dense tensors passed between the encoder, the head, and the evaluator.

/// Dense (B, C, H, W) tensor in row-major order
#[derive(Clone, Debug, PartialEq)]
pub struct Representation {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl Representation {
    pub fn zeros(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self { shape: [batch, channels, height, width], data: vec![0.0; batch * channels * height * width] }
    }

    /// Wrap a flat buffer; `None` when its length disagrees with `shape`
    pub fn from_vec(shape: [usize; 4], data: Vec<f32>) -> Option<Self> {
        (shape.iter().product::<usize>() == data.len()).then_some(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn batch(&self) -> usize {
        self.shape[0]
    }

    pub fn channels(&self) -> usize {
        self.shape[1]
    }

    pub fn height(&self) -> usize {
        self.shape[2]
    }

    pub fn width(&self) -> usize {
        self.shape[3]
    }

    /// Elements per sample (C * H * W)
    pub fn sample_len(&self) -> usize {
        self.shape[1] * self.shape[2] * self.shape[3]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn sample(&self, b: usize) -> &[f32] {
        let len = self.sample_len();
        &self.data[b * len..(b + 1) * len]
    }

    #[inline]
    pub fn offset(&self, b: usize, c: usize, y: usize, x: usize) -> usize {
        ((b * self.shape[1] + c) * self.shape[2] + y) * self.shape[3] + x
    }

    pub fn get(&self, b: usize, c: usize, y: usize, x: usize) -> f32 {
        self.data[self.offset(b, c, y, x)]
    }
}

/// Unnormalized class scores, (B, K)
#[derive(Clone, Debug, PartialEq)]
pub struct Logits {
    batch: usize,
    num_classes: usize,
    data: Vec<f32>,
}

impl Logits {
    pub fn zeros(batch: usize, num_classes: usize) -> Self {
        Self { batch, num_classes, data: vec![0.0; batch * num_classes] }
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Self {
        let num_classes = rows.first().map_or(0, Vec::len);
        debug_assert!(rows.iter().all(|r| r.len() == num_classes));
        Self { batch: rows.len(), num_classes, data: rows.concat() }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn row(&self, b: usize) -> &[f32] {
        &self.data[b * self.num_classes..(b + 1) * self.num_classes]
    }

    pub fn row_mut(&mut self, b: usize) -> &mut [f32] {
        &mut self.data[b * self.num_classes..(b + 1) * self.num_classes]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.num_classes.max(1)).take(self.batch)
    }
}
