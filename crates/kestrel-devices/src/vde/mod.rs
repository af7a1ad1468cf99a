//! Video-decode block peripherals.
//!
//! Only the security/crypto command-queue engine ([`bse`]) is modeled in
//! full. The rest of the block — the bitstream parsing front-end, the
//! macroblock and post-processing engines — appears here only as the
//! collaborators the security engine talks to (see [`sxe`]).

pub mod bse;
pub mod cipher;
pub mod sxe;
