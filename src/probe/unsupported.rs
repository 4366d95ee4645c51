//! Fallback probe for targets without a native implementation.

use anyhow::Result;

use super::{ActivityProbe, RawSample};
use crate::error::ProbeUnavailable;

pub struct NativeProbe;

impl NativeProbe {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }
}

impl ActivityProbe for NativeProbe {
    fn sample(&self) -> RawSample {
        RawSample::unknown(ProbeUnavailable::new("platform", std::env::consts::OS))
    }
}
