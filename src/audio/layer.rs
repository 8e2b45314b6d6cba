use tracing::debug;

/// One pass of recorded audio. Layers stack additively; a layer shorter
/// than the loop (left over from before a multiply) tiles by reading
/// modulo its own length.
#[derive(Debug, Clone, Default)]
pub struct LoopLayer {
    pub samples: Vec<f32>,
}

impl LoopLayer {
    pub fn zeroed(frames: usize) -> Self {
        Self {
            samples: vec![0.0; frames],
        }
    }

    pub fn sample(&self, frame: u64) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples[(frame % self.samples.len() as u64) as usize]
    }
}

/// One loop of a track: a stack of layers plus undo history.
#[derive(Debug, Default)]
pub struct LoopSlot {
    pub layers: Vec<LoopLayer>,
    pub redo: Vec<LoopLayer>,
    pub frames: u64,
    pub cycle_frames: u64,
}

impl LoopSlot {
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    pub fn cycles(&self) -> u32 {
        if self.cycle_frames == 0 {
            0
        } else {
            (self.frames / self.cycle_frames) as u32
        }
    }

    /// Mixed playback sample at a frame.
    pub fn sample(&self, frame: u64) -> f32 {
        self.layers.iter().map(|l| l.sample(frame)).sum()
    }

    /// Collapse the layer stack into a single layer of the loop's length.
    /// Commits the stack: per-layer undo history ends here.
    pub fn flatten(&mut self) {
        if self.layers.len() <= 1 && self.layers.first().map(|l| l.samples.len() as u64) == Some(self.frames)
        {
            return;
        }
        debug!(layers = self.layers.len(), "flattening layer stack");
        let mut flat = LoopLayer::zeroed(self.frames as usize);
        for i in 0..self.frames {
            flat.samples[i as usize] = self.sample(i);
        }
        self.layers.clear();
        self.layers.push(flat);
        self.redo.clear();
    }

    pub fn clear(&mut self) {
        self.layers.clear();
        self.redo.clear();
        self.frames = 0;
        self.cycle_frames = 0;
    }

    /// Drop the most recent layer, keeping it for redo. The base layer is
    /// never undone.
    pub fn undo_layer(&mut self) -> bool {
        if self.layers.len() <= 1 {
            return false;
        }
        if let Some(layer) = self.layers.pop() {
            self.redo.push(layer);
        }
        true
    }

    pub fn redo_layer(&mut self) -> bool {
        if let Some(layer) = self.redo.pop() {
            self.layers.push(layer);
            true
        } else {
            false
        }
    }
}
