//! Channel data kinds and values.
//!
//! A channel's [`DataKind`] is fixed when it is created. Values cross the
//! engine as the tagged [`Value`] enum; drivers work with native Rust types
//! through [`PvType`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Declared data kind of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataKind {
    /// 32-bit signed integer (also used for enumerations).
    Int32 = 0,
    /// 64-bit float.
    Float64 = 1,
    /// Signed byte array.
    Int8Array = 2,
    /// Unsigned byte array.
    UInt8Array = 3,
    /// 32-bit signed integer array.
    Int32Array = 4,
    /// 64-bit float array.
    Float64Array = 5,
    /// UTF-8 string.
    String = 6,
}

impl DataKind {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Int32),
            1 => Some(Self::Float64),
            2 => Some(Self::Int8Array),
            3 => Some(Self::UInt8Array),
            4 => Some(Self::Int32Array),
            5 => Some(Self::Float64Array),
            6 => Some(Self::String),
            _ => None,
        }
    }

    /// True for the array kinds (`max_elements` applies).
    #[inline]
    pub const fn is_array(self) -> bool {
        matches!(
            self,
            Self::Int8Array | Self::UInt8Array | Self::Int32Array | Self::Float64Array
        )
    }

    /// Short lower-case name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int32 => "int32",
            Self::Float64 => "float64",
            Self::Int8Array => "int8[]",
            Self::UInt8Array => "uint8[]",
            Self::Int32Array => "int32[]",
            Self::Float64Array => "float64[]",
            Self::String => "string",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value carried by a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit float.
    Float64(f64),
    /// Signed byte array.
    Int8Array(Vec<i8>),
    /// Unsigned byte array.
    UInt8Array(Vec<u8>),
    /// 32-bit signed integer array.
    Int32Array(Vec<i32>),
    /// 64-bit float array.
    Float64Array(Vec<f64>),
    /// UTF-8 string.
    String(String),
}

impl Value {
    /// Kind of this value.
    pub const fn kind(&self) -> DataKind {
        match self {
            Self::Int32(_) => DataKind::Int32,
            Self::Float64(_) => DataKind::Float64,
            Self::Int8Array(_) => DataKind::Int8Array,
            Self::UInt8Array(_) => DataKind::UInt8Array,
            Self::Int32Array(_) => DataKind::Int32Array,
            Self::Float64Array(_) => DataKind::Float64Array,
            Self::String(_) => DataKind::String,
        }
    }

    /// Number of elements: 1 for scalars, the length for arrays and strings.
    pub fn len(&self) -> usize {
        match self {
            Self::Int32(_) | Self::Float64(_) => 1,
            Self::Int8Array(v) => v.len(),
            Self::UInt8Array(v) => v.len(),
            Self::Int32Array(v) => v.len(),
            Self::Float64Array(v) => v.len(),
            Self::String(s) => s.len(),
        }
    }

    /// True for empty arrays and strings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero value of a kind, held by variable channels before the first write.
    pub fn default_for(kind: DataKind) -> Self {
        match kind {
            DataKind::Int32 => Self::Int32(0),
            DataKind::Float64 => Self::Float64(0.0),
            DataKind::Int8Array => Self::Int8Array(Vec::new()),
            DataKind::UInt8Array => Self::UInt8Array(Vec::new()),
            DataKind::Int32Array => Self::Int32Array(Vec::new()),
            DataKind::Float64Array => Self::Float64Array(Vec::new()),
            DataKind::String => Self::String(String::new()),
        }
    }
}

/// Native Rust types a channel can carry.
pub trait PvType: Clone + Send + Sync + 'static {
    /// Kind declared by channels of this type.
    const KIND: DataKind;

    /// Wrap into a [`Value`].
    fn into_value(self) -> Value;

    /// Unwrap from a [`Value`]; `None` if the kind does not match.
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_pv_type {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl PvType for $ty {
                const KIND: DataKind = DataKind::$variant;

                #[inline]
                fn into_value(self) -> Value {
                    Value::$variant(self)
                }

                #[inline]
                fn from_value(value: Value) -> Option<Self> {
                    match value {
                        Value::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )+
    };
}

impl_pv_type! {
    i32 => Int32,
    f64 => Float64,
    Vec<i8> => Int8Array,
    Vec<u8> => UInt8Array,
    Vec<i32> => Int32Array,
    Vec<f64> => Float64Array,
    String => String,
}

/// Direction of a channel, seen from the control system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to control system: the driver pushes, callers read.
    Input,
    /// Control system to device: callers write, the driver receives.
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// When the value of a channel is considered refreshed.
///
/// Only recorded and exposed here; the periodic timer belongs to the
/// control-system interface adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScanPolicy {
    /// Re-read on a fixed interval.
    Periodic(Duration),
    /// Updated only on explicit write.
    #[default]
    Passive,
    /// Pushed asynchronously by the driver, never polled.
    Interrupt,
}
