//! Relocation of book files into the canonical destination layout.

pub mod layout;
pub mod mutator;

pub use layout::destination_for;
pub use mutator::FileMutator;
