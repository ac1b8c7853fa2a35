//! Container and volume inspectors.

pub mod container;
pub mod volume;

pub use self::container::{ContainerInspector, StorageMount};
pub use self::volume::{directory_size, VolumeInspector, VolumeLimits};
