//! Board configuration, read from a TOML file.
//!
//! Every compile-time board variant of the bootloader is a runtime field here.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::*;
use crate::env::Environment;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config file failed: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Soc {
    #[default]
    R8a7795,
    R8a7796,
    R8a77965,
    R8a77990,
    R8a77995,
}

impl Soc {
    /// SoC bits of the device tree id
    fn plat_bits(&self) -> u32 {
        match self {
            Soc::R8a7795 => 0x0077_9500,
            Soc::R8a7796 => 0x0077_9600,
            Soc::R8a77965 => 0x0077_9650,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BoardVariant {
    #[default]
    Ulcb,
    SalvatorX,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DramMode {
    #[default]
    Default,
    /// BL2 reports the DRAM configuration in arg1
    Auto,
    #[serde(rename = "map4_2")]
    Map4_2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub soc: Soc,
    pub rev_integer: u32,
    pub rev_fraction: u32,
    /// Raw byte from the PMIC EEPROM at offset 0x70
    pub board_id: u8,
    pub variant: BoardVariant,
    pub dram_mode: DramMode,
    pub dram_arg1: u32,
    pub adsp: bool,
    pub product_partition: bool,
    pub bootloader_size: u32,
    pub ipl_locked: bool,
    pub mmc_block_size: u64,
    pub text_base: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            soc: Soc::R8a7795,
            rev_integer: 3,
            rev_fraction: 0,
            board_id: 0x58,
            variant: BoardVariant::Ulcb,
            dram_mode: DramMode::Default,
            dram_arg1: 0,
            adsp: false,
            product_partition: true,
            bootloader_size: 0x0040_0000,
            ipl_locked: true,
            mmc_block_size: 512,
            text_base: DEFAULT_TEXT_BASE,
        }
    }
}

impl BoardConfig {
    /// CPU revision as reported in `androidboot.revision`
    pub fn cpu_revision(&self) -> (u32, u32) {
        if self.soc == Soc::R8a7796 && self.rev_integer == 2 && self.rev_fraction == 0 {
            // v2.0 is reported as v1.1
            return (1, 1);
        }
        (self.rev_integer, self.rev_fraction)
    }

    /// Device tree id: <board id><SiP><revision>
    pub fn plat_id(&self) -> u32 {
        let (rev_integer, rev_fraction) = match self.soc {
            Soc::R8a77965 => (0, 0),
            _ => self.cpu_revision(),
        };
        let mut plat_id = ((rev_integer << 4) & 0xf0) | (rev_fraction & 0x0f);
        plat_id |= self.soc.plat_bits();
        // unprogrammed EEPROM
        let board_id = if self.board_id == 0xff { 0 } else { self.board_id };
        plat_id | (((board_id >> 3) as u32) << 24)
    }

    /// H3 platform ids of this board variant: (v3, v2)
    pub fn h3_plat_ids(&self) -> (u32, u32) {
        match self.variant {
            BoardVariant::Ulcb => (ULCB_H3V3_PLAT_ID, ULCB_H3V2_PLAT_ID),
            BoardVariant::SalvatorX => (SALVATOR_X_H3V3_PLAT_ID, SALVATOR_X_H3V2_PLAT_ID),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvbConfig {
    pub unlocked: bool,
    /// Report loaded images as verified instead of as verification errors
    pub assume_verified: bool,
    /// BL2 decrements the try counter before we run
    pub upstream_decrements_tries: bool,
    pub virtual_ab: bool,
    pub rollback_indexes: Vec<u64>,
}

impl Default for AvbConfig {
    fn default() -> Self {
        AvbConfig {
            unlocked: false,
            assume_verified: false,
            upstream_decrements_tries: true,
            virtual_ab: false,
            rollback_indexes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub board: BoardConfig,
    pub avb: AvbConfig,
    pub env: BTreeMap<String, String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let data = fs::read_to_string(path)?;
        Config::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(data)?)
    }

    pub fn environment(&self) -> Environment {
        self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }

    /// Template written by `boota --config` when no file exists yet
    pub fn template() -> String {
        toml::to_string(&Config::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(soc: Soc, rev: (u32, u32), board_id: u8) -> BoardConfig {
        BoardConfig { soc, rev_integer: rev.0, rev_fraction: rev.1, board_id, ..BoardConfig::default() }
    }

    #[test]
    fn plat_id_h3_ulcb() {
        assert_eq!(board(Soc::R8a7795, (3, 0), 0x58).plat_id(), ULCB_H3V3_PLAT_ID);
        assert_eq!(board(Soc::R8a7795, (2, 0), 0x58).plat_id(), ULCB_H3V2_PLAT_ID);
        assert_eq!(board(Soc::R8a7795, (3, 0), 0x20).plat_id(), SALVATOR_X_H3V3_PLAT_ID);
    }

    #[test]
    fn plat_id_quirks() {
        assert_eq!(board(Soc::R8a7796, (2, 0), 0).plat_id(), 0x0077_9611);
        assert_eq!(board(Soc::R8a7796, (2, 0), 0).cpu_revision(), (1, 1));
        assert_eq!(board(Soc::R8a77965, (1, 1), 0).plat_id(), 0x0077_9650);
        assert_eq!(board(Soc::R8a77965, (1, 1), 0).cpu_revision(), (1, 1));
        assert_eq!(board(Soc::R8a7795, (3, 0), 0xff).plat_id(), 0x0077_9530);
    }

    #[test]
    fn parse_partial_file() {
        let cfg = Config::from_toml(
            r#"
            [board]
            soc = "r8a7796"
            variant = "salvator-x"
            dram_mode = "map4_2"

            [env]
            bootargs = "console=ttySC0,115200"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.board.soc, Soc::R8a7796);
        assert_eq!(cfg.board.variant, BoardVariant::SalvatorX);
        assert_eq!(cfg.board.dram_mode, DramMode::Map4_2);
        assert_eq!(cfg.board.text_base, DEFAULT_TEXT_BASE);
        assert!(cfg.avb.upstream_decrements_tries);
        assert_eq!(cfg.environment().get("bootargs"), Some("console=ttySC0,115200"));
    }

    #[test]
    fn template_parses_back() {
        assert_eq!(Config::from_toml(&Config::template()).unwrap(), Config::default());
    }

    #[test]
    fn bad_file_is_parse_error() {
        assert!(matches!(Config::from_toml("[board]\nsoc = 3"), Err(ConfigError::Parse(_))));
    }
}
