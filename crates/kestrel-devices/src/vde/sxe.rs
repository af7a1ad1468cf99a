//! Minimal model of the bitstream-parsing front-end registers.
//!
//! The security engine exposes one undocumented read-only offset computed
//! from two of these registers (see `bse`); only the fields that alias
//! consumes are modeled here.

/// Debug/status registers of the parsing front-end.
#[derive(Debug, Default)]
pub struct SxeRegs {
    frame_bits: u32,
    slice_count: u32,
}

impl SxeRegs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_bits(&self) -> u32 {
        self.frame_bits
    }

    pub fn set_frame_bits(&mut self, value: u32) {
        self.frame_bits = value;
    }

    pub fn slice_count(&self) -> u32 {
        self.slice_count
    }

    pub fn set_slice_count(&mut self, value: u32) {
        self.slice_count = value;
    }
}
