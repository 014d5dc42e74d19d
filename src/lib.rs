pub use pontoon_core::*;
