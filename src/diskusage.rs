//! Disk usage calculators
//!
//! A calculator maps a file's logical byte count to the raw bytes it
//! occupies on the underlying storage. Calculators are selected by name in
//! the configuration's `layout` section; parameters come from the layout's
//! `parameters` node.

use crate::error::{Error, Result};
use serde::Deserialize;

/// Converts logical bytes to raw storage bytes.
pub trait Calculator: Send + Sync + std::fmt::Debug {
    fn raw_bytes(&self, logical: i64) -> i64;

    /// The registry name this calculator was built from.
    fn name(&self) -> &'static str;
}

/// `bytes`: the size of each file is the number of bytes used.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Calculator for Identity {
    fn raw_bytes(&self, logical: i64) -> i64 {
        logical
    }

    fn name(&self) -> &'static str {
        "bytes"
    }
}

/// `block`: every file occupies a whole number of fixed-size blocks.
#[derive(Debug, Clone, Copy)]
pub struct Block {
    block_size: i64,
}

impl Block {
    pub fn new(block_size: i64) -> Self {
        Self { block_size }
    }
}

impl Calculator for Block {
    fn raw_bytes(&self, logical: i64) -> i64 {
        if logical == 0 {
            return 0;
        }
        (logical + self.block_size - 1) / self.block_size * self.block_size
    }

    fn name(&self) -> &'static str {
        "block"
    }
}

/// `raid0`: files are striped across `num_stripes` disks in units of
/// `stripe_size`; each stripe that received data rounds up to a whole
/// stripe.
#[derive(Debug, Clone, Copy)]
pub struct RAID0 {
    stripe_size: i64,
    num_stripes: i32,
}

impl RAID0 {
    pub fn new(stripe_size: i64, num_stripes: i32) -> Self {
        Self {
            stripe_size,
            num_stripes,
        }
    }
}

impl Calculator for RAID0 {
    fn raw_bytes(&self, logical: i64) -> i64 {
        let row = self.stripe_size * i64::from(self.num_stripes);
        let full_rows = logical / row;
        let remainder = logical % row;
        let rounded = (remainder + self.stripe_size - 1) / self.stripe_size * self.stripe_size;
        full_rows * row + rounded
    }

    fn name(&self) -> &'static str {
        "raid0"
    }
}

#[derive(Debug, Deserialize)]
struct BlockParams {
    size: i64,
}

#[derive(Debug, Deserialize)]
struct RAID0Params {
    stripe_size: i64,
    num_stripes: i32,
}

/// Build a calculator from its registry name and YAML parameters.
///
/// An empty name selects `bytes`. Names are matched case-insensitively.
pub fn for_layout(name: &str, params: &serde_yaml::Value) -> Result<Box<dyn Calculator>> {
    match name.to_lowercase().as_str() {
        "" | "bytes" => Ok(Box::new(Identity)),
        "block" => {
            let p: BlockParams = serde_yaml::from_value(params.clone()).map_err(|e| {
                Error::BadConfig(format!("failed parsing block layout parameters: {e}"))
            })?;
            if p.size <= 0 {
                return Err(Error::BadConfig(format!(
                    "block size must be positive, got {}",
                    p.size
                )));
            }
            Ok(Box::new(Block::new(p.size)))
        }
        "raid0" => {
            let p: RAID0Params = serde_yaml::from_value(params.clone()).map_err(|e| {
                Error::BadConfig(format!("failed parsing raid0 layout parameters: {e}"))
            })?;
            if p.stripe_size <= 0 || p.num_stripes <= 0 {
                return Err(Error::BadConfig(format!(
                    "raid0 parameters must be positive, got stripe_size {} num_stripes {}",
                    p.stripe_size, p.num_stripes
                )));
            }
            Ok(Box::new(RAID0::new(p.stripe_size, p.num_stripes)))
        }
        other => Err(Error::UnsupportedCalculator(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let c = Identity;
        assert_eq!(c.raw_bytes(0), 0);
        assert_eq!(c.raw_bytes(12345), 12345);
    }

    #[test]
    fn test_block() {
        let c = Block::new(4096);
        assert_eq!(c.raw_bytes(0), 0);
        assert_eq!(c.raw_bytes(1), 4096);
        assert_eq!(c.raw_bytes(4096), 4096);
        assert_eq!(c.raw_bytes(4097), 8192);
    }

    #[test]
    fn test_raid0() {
        let c = RAID0::new(4096, 4);
        assert_eq!(c.raw_bytes(0), 0);
        assert_eq!(c.raw_bytes(1), 4096);
        assert_eq!(c.raw_bytes(4 * 4096), 16384);
        assert_eq!(c.raw_bytes(4 * 4096 + 1), 20480);
    }

    #[test]
    fn test_registry() {
        let none = serde_yaml::Value::Null;
        assert_eq!(for_layout("", &none).unwrap().name(), "bytes");
        assert_eq!(for_layout("BYTES", &none).unwrap().name(), "bytes");

        let params: serde_yaml::Value = serde_yaml::from_str("size: 512").unwrap();
        let c = for_layout("block", &params).unwrap();
        assert_eq!(c.raw_bytes(513), 1024);

        let params: serde_yaml::Value =
            serde_yaml::from_str("stripe_size: 1024\nnum_stripes: 2").unwrap();
        let c = for_layout("raid0", &params).unwrap();
        assert_eq!(c.raw_bytes(1025), 2048);

        assert!(matches!(
            for_layout("zfs", &none),
            Err(Error::UnsupportedCalculator(_))
        ));
        assert!(for_layout("block", &none).is_err());
    }
}
