/// Peripheral drivers.
pub mod sdmmc;
