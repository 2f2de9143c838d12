pub mod memory;
pub mod null;
pub mod ses;
