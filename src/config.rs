//! Construction-time configuration: controller type, drive models, densities,
//! reel sizes, and two policy flags left as resolved open questions (see
//! DESIGN.md).

use serde::Deserialize;

use crate::error::ConfigError;

/// Selects the command validity table, status-bit mapping, and timing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerType {
    /// HP 13181: HP-1000, NRZI 800 bpi only.
    Nrzi1000,
    /// HP 13183: HP-1000, PE 1600 bpi only.
    Pe1000,
    /// HP 30215: HP-3000 channel interface, dual density.
    Hp3000,
    /// HP-IB interface, byte-at-a-time transfers.
    HpIb,
}

/// Recording density.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Density {
    Nrzi800,
    Pe1600,
}

/// Drive model, each with a fixed native density and erase-gap length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveModel {
    /// NRZI, 800 bpi.
    Hp7970B,
    /// PE, 1600 bpi.
    Hp7970E,
    /// Dual density, 800/1600 bpi.
    Hp7974,
    /// Dual density, 800/1600 bpi, HP-IB.
    Hp7978,
}

impl DriveModel {
    /// Erase-gap length in bytes at the model's native density.
    pub fn gap_length(&self, density: Density) -> u32 {
        match density {
            Density::Nrzi800 => 48,
            Density::Pe1600 => 96,
        }
    }

    /// Densities this model can be configured for.
    pub fn supported_densities(&self) -> &'static [Density] {
        match self {
            DriveModel::Hp7970B => &[Density::Nrzi800],
            DriveModel::Hp7970E => &[Density::Pe1600],
            DriveModel::Hp7974 | DriveModel::Hp7978 => &[Density::Nrzi800, Density::Pe1600],
        }
    }
}

/// Reel capacity, expressed either as a standard reel length or a raw byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReelSize {
    Unlimited,
    Ft600,
    Ft1200,
    Ft2400,
}

impl ReelSize {
    /// Capacity in bytes at the given density (`feet * 12in * bpi`), or `None`
    /// for [`ReelSize::Unlimited`].
    pub fn capacity_bytes(&self, density: Density) -> Option<u64> {
        let bpi = match density {
            Density::Nrzi800 => 800u64,
            Density::Pe1600 => 1600u64,
        };

        let feet = match self {
            ReelSize::Unlimited => return None,
            ReelSize::Ft600 => 600u64,
            ReelSize::Ft1200 => 1200u64,
            ReelSize::Ft2400 => 2400u64,
        };

        Some(feet * 12 * bpi)
    }
}

/// Whether the real-world delay tables or the small constant "fast" delays are
/// used for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    Fast,
    Realtime,
}

impl Default for TimingMode {
    fn default() -> Self {
        TimingMode::Fast
    }
}

/// Per-drive configuration.
#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub model: DriveModel,
    pub density: Density,
    pub reel: ReelSize,
    /// Explicit capacity override; clears the `reel` setting when set.
    pub capacity_bytes: Option<u64>,
}

impl DriveConfig {
    pub fn new(model: DriveModel, density: Density) -> Result<Self, ConfigError> {
        if !model.supported_densities().contains(&density) {
            return Err(ConfigError::UnsupportedDensity { model, density });
        }

        Ok(Self {
            model,
            density,
            reel: ReelSize::Ft2400,
            capacity_bytes: None,
        })
    }

    pub fn with_reel(mut self, reel: ReelSize) -> Self {
        self.reel = reel;
        self.capacity_bytes = None;
        self
    }

    pub fn with_capacity_bytes(mut self, bytes: u64) -> Result<Self, ConfigError> {
        if bytes == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        self.capacity_bytes = Some(bytes);
        self.reel = ReelSize::Unlimited;
        Ok(self)
    }

    /// Effective capacity in bytes, or `None` for unlimited.
    pub fn capacity_bytes(&self) -> Option<u64> {
        self.capacity_bytes
            .or_else(|| self.reel.capacity_bytes(self.density))
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        DriveConfig::new(DriveModel::Hp7970B, Density::Nrzi800).expect("default drive config")
    }
}

/// Top-level controller configuration, fixed for the controller's lifetime.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub controller_type: ControllerType,
    pub timing: TimingMode,
    pub drives: [DriveConfig; 4],

    /// Resolved open question: whether a DRESETINT that arrives while the
    /// controller is mid-command triggers an immediate drive-attention poll.
    /// Default `false`; see DESIGN.md for the rationale.
    pub poll_on_reset_interrupt: bool,

    /// Resolved open question: override for the HP3000 command-reject
    /// interrupt delay. `None` uses `ir_start` from the active timing table.
    pub reject_interrupt_delay_ticks: Option<u32>,
}

impl ControllerConfig {
    pub fn new(controller_type: ControllerType) -> Self {
        Self {
            controller_type,
            timing: TimingMode::default(),
            drives: [
                DriveConfig::default(),
                DriveConfig::default(),
                DriveConfig::default(),
                DriveConfig::default(),
            ],
            poll_on_reset_interrupt: false,
            reject_interrupt_delay_ticks: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for drive in &self.drives {
            if drive.capacity_bytes() == Some(0) {
                return Err(ConfigError::ZeroCapacity);
            }

            let supports_7978 = matches!(
                self.controller_type,
                ControllerType::HpIb | ControllerType::Hp3000
            );
            if drive.model == DriveModel::Hp7978 && !supports_7978 {
                return Err(ConfigError::UnsupportedDriveModel {
                    controller: self.controller_type,
                    model: drive.model,
                });
            }
        }

        Ok(())
    }

    pub fn set_drive(&mut self, index: usize, drive: DriveConfig) -> Result<(), ConfigError> {
        if index >= self.drives.len() {
            return Err(ConfigError::DriveIndexOutOfRange(index));
        }
        self.drives[index] = drive;
        Ok(())
    }
}

/// One drive's entry in a TOML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct DriveFileConfig {
    pub model: DriveModel,
    pub density: Density,
    #[serde(default)]
    pub reel: Option<ReelSize>,
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl DriveFileConfig {
    fn into_drive_config(self) -> Result<DriveConfig, ConfigError> {
        let mut drive = DriveConfig::new(self.model, self.density)?;
        if let Some(bytes) = self.capacity_bytes {
            drive = drive.with_capacity_bytes(bytes)?;
        } else if let Some(reel) = self.reel {
            drive = drive.with_reel(reel);
        }
        Ok(drive)
    }
}

/// Top-level TOML configuration file shape, deserialized by `hp3000_ms`
///
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub controller_type: ControllerType,
    #[serde(default)]
    pub timing: Option<TimingMode>,
    #[serde(default)]
    pub poll_on_reset_interrupt: bool,
    #[serde(default)]
    pub reject_interrupt_delay_ticks: Option<u32>,
    #[serde(default)]
    pub drives: Vec<DriveFileConfig>,
}

impl ConfigFile {
    /// Converts a parsed file into a validated [`ControllerConfig`], plus the
    /// per-unit image path / read-only flag the caller uses to attach media.
    pub fn into_controller_config(
        self,
    ) -> Result<(ControllerConfig, Vec<(Option<String>, bool)>), ConfigError> {
        let mut config = ControllerConfig::new(self.controller_type);
        if let Some(timing) = self.timing {
            config.timing = timing;
        }
        config.poll_on_reset_interrupt = self.poll_on_reset_interrupt;
        config.reject_interrupt_delay_ticks = self.reject_interrupt_delay_ticks;

        let mut attachments = vec![(None, false); 4];
        for (index, drive_file) in self.drives.into_iter().enumerate().take(4) {
            let image = drive_file.image.clone();
            let read_only = drive_file.read_only;
            config.set_drive(index, drive_file.into_drive_config()?)?;
            attachments[index] = (image, read_only);
        }

        Ok((config, attachments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reel_capacity_matches_feet_times_bpi() {
        let bytes = ReelSize::Ft2400
            .capacity_bytes(Density::Nrzi800)
            .unwrap();
        assert_eq!(bytes, 2400 * 12 * 800);
    }

    #[test]
    fn unlimited_reel_has_no_capacity() {
        assert_eq!(ReelSize::Unlimited.capacity_bytes(Density::Pe1600), None);
    }

    #[test]
    fn drive_config_rejects_unsupported_density() {
        let err = DriveConfig::new(DriveModel::Hp7970B, Density::Pe1600).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnsupportedDensity {
                model: DriveModel::Hp7970B,
                density: Density::Pe1600
            }
        );
    }

    #[test]
    fn explicit_capacity_overrides_reel() {
        let drive = DriveConfig::new(DriveModel::Hp7974, Density::Nrzi800)
            .unwrap()
            .with_capacity_bytes(1_000_000)
            .unwrap();
        assert_eq!(drive.capacity_bytes(), Some(1_000_000));
    }

    #[test]
    fn hp7978_rejected_on_nrzi1000_controller() {
        let mut config = ControllerConfig::new(ControllerType::Nrzi1000);
        config
            .set_drive(
                0,
                DriveConfig::new(DriveModel::Hp7978, Density::Nrzi800).unwrap(),
            )
            .unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedDriveModel { .. })
        ));
    }
}
