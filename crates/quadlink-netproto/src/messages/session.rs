//! Membership and identity types exchanged on join.

use strum::FromRepr;

use crate::constants::DEFAULT_LAG;
use crate::error::ProtoError;
use crate::messages::input::InputMap;
use crate::packet::{Packet, Wire};

/// Controller pak inserted in a physical port.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRepr)]
pub enum Pak {
    #[default]
    None = 1,
    Memory = 2,
    Rumble = 3,
    Transfer = 4,
}

impl Wire for Pak {
    fn put(&self, p: &mut Packet) {
        p.write(&(*self as u8));
    }

    fn get(p: &mut Packet) -> Result<Self, ProtoError> {
        let raw = p.read::<u8>()?;
        Pak::from_repr(raw).ok_or(ProtoError::UnknownPak(raw))
    }
}

/// One physical controller port as reported by the host input plugin.
/// `raw_data` is always forced false before transmission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Controller {
    pub present: bool,
    pub raw_data: bool,
    pub pak: Pak,
}

impl Wire for Controller {
    fn put(&self, p: &mut Packet) {
        p.write(&self.present).write(&self.raw_data).write(&self.pak);
    }

    fn get(p: &mut Packet) -> Result<Self, ProtoError> {
        Ok(Controller {
            present: p.read::<bool>()?,
            raw_data: p.read::<bool>()?,
            pak: p.read::<Pak>()?,
        })
    }
}

/// Identity of the ROM a user has loaded, for matching players up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RomInfo {
    pub crc1: u32,
    pub crc2: u32,
    pub name: String,
    pub country_code: u8,
    pub version: u8,
}

impl RomInfo {
    pub fn is_known(&self) -> bool {
        self.crc1 != 0 && self.crc2 != 0
    }
}

impl std::fmt::Display for RomInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:08X}-{:08X}", self.name, self.crc1, self.crc2)
    }
}

impl Wire for RomInfo {
    fn put(&self, p: &mut Packet) {
        p.write(&self.crc1)
            .write(&self.crc2)
            .write(&self.name)
            .write(&self.country_code)
            .write(&self.version);
    }

    fn get(p: &mut Packet) -> Result<Self, ProtoError> {
        Ok(RomInfo {
            crc1: p.read::<u32>()?,
            crc2: p.read::<u32>()?,
            name: p.read::<String>()?,
            country_code: p.read::<u8>()?,
            version: p.read::<u8>()?,
        })
    }
}

/// Opaque save blob, forwarded between users without interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveInfo {
    pub rom_name: String,
    pub save_name: String,
    pub save_data: Vec<u8>,
    pub sha1_data: Vec<u8>,
}

impl Wire for SaveInfo {
    fn put(&self, p: &mut Packet) {
        p.write(&self.rom_name)
            .write(&self.save_name)
            .write(&self.save_data)
            .write(&self.sha1_data);
    }

    fn get(p: &mut Packet) -> Result<Self, ProtoError> {
        Ok(SaveInfo {
            rom_name: p.read::<String>()?,
            save_name: p.read::<String>()?,
            save_data: p.read::<Vec<u8>>()?,
            sha1_data: p.read::<Vec<u8>>()?,
        })
    }
}

/// Everything a room member publishes about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    /// Server-assigned, monotonic, never reused.
    pub id: u32,
    pub authority_owner: u32,
    pub name: String,
    pub rom: RomInfo,
    pub saves: [SaveInfo; 5],
    pub lag: u8,
    /// Seconds; NaN = unknown.
    pub latency: f64,
    pub controllers: [Controller; 4],
    pub map: InputMap,
    pub manual_map: bool,
}

impl Default for UserInfo {
    fn default() -> Self {
        Self {
            id: u32::MAX,
            authority_owner: u32::MAX,
            name: String::new(),
            rom: RomInfo::default(),
            saves: Default::default(),
            lag: DEFAULT_LAG,
            latency: f64::NAN,
            controllers: Default::default(),
            map: InputMap::default(),
            manual_map: false,
        }
    }
}

impl UserInfo {
    /// A player presents at least one controller; everyone else spectates.
    pub fn is_player(&self) -> bool {
        self.controllers.iter().any(|c| c.present)
    }
}

impl Wire for UserInfo {
    fn put(&self, p: &mut Packet) {
        p.write(&self.id)
            .write(&self.authority_owner)
            .write(&self.name)
            .write(&self.rom);
        for save in &self.saves {
            p.write(save);
        }
        p.write(&self.lag).write(&self.latency);
        for controller in &self.controllers {
            p.write(controller);
        }
        p.write(&self.map).write(&self.manual_map);
    }

    fn get(p: &mut Packet) -> Result<Self, ProtoError> {
        let id = p.read::<u32>()?;
        let authority_owner = p.read::<u32>()?;
        let name = p.read::<String>()?;
        let rom = p.read::<RomInfo>()?;
        let mut saves: [SaveInfo; 5] = Default::default();
        for save in &mut saves {
            *save = p.read::<SaveInfo>()?;
        }
        let lag = p.read::<u8>()?;
        let latency = p.read::<f64>()?;
        let mut controllers = [Controller::default(); 4];
        for controller in &mut controllers {
            *controller = p.read::<Controller>()?;
        }
        let map = p.read::<InputMap>()?;
        let manual_map = p.read::<bool>()?;
        Ok(UserInfo {
            id,
            authority_owner,
            name,
            rom,
            saves,
            lag,
            latency,
            controllers,
            map,
            manual_map,
        })
    }
}
