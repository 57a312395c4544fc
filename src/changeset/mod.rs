// Change-set model - descriptors for one request's entity changes

pub mod decoder;
pub mod descriptor;

pub use decoder::{decode, decode_slice, DecodedChangeSet, SaveOptions};
pub use descriptor::{ChangeKind, EntityDescriptor};
