/// External memory: the FMC SDRAM bring-up and its post-init self-test.
pub mod fmc;
pub mod region;
pub mod sdram;
pub mod selftest;

pub use fmc::{Fmc, FMC_BASE};
pub use region::{MappedRegion, MemoryRegion, RegionAccess, KIB, MIB};
pub use sdram::{
    bring_up, Bank, BurstLength, BurstType, CasLatency, CommandMode, MemoryCommand,
    ModeRegister, SdramConfig, SdramController, SdramError, SdramTiming, WriteBurst,
};
pub use selftest::{self_test, Density, SelfTestConfig, VerificationFailure};
