use crate::prelude::*;

use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

// archive and housekeeping commands
pub const CMD_DAY_ARCHIVE: u32 = 0x7000_0200;
pub const CMD_MONTH_ARCHIVE: u32 = 0x7020_0200;
pub const CMD_EVENTS_USER: u32 = 0x7010_0200;
pub const CMD_EVENTS_INSTALLER: u32 = 0x7012_0200;
pub const CMD_DEVICE_LIST: u32 = 0x0000_0200;
pub const DEVICE_LIST_FIRST: u32 = 0x00FF_FE00;
pub const DEVICE_LIST_LAST: u32 = 0x00FF_FEFF;

// record widths in bytes
pub const RECORD_ARCHIVE: usize = 12;
pub const RECORD_QWORD: usize = 16;
pub const RECORD_DWORD: usize = 28;
pub const RECORD_TEXT: usize = 40;

// "value unavailable" bit patterns
pub const NAN_S32: u32 = 0x8000_0000;
pub const NAN_U32: u32 = 0xFFFF_FFFF;
pub const NAN_S64: u64 = 0x8000_0000_0000_0000;
pub const NAN_U64: u64 = 0xFFFF_FFFF_FFFF_FFFF;

pub fn is_nan_dword(v: u32) -> bool {
    v == NAN_U32 || v == NAN_S32
}

pub fn is_nan_qword(v: u64) -> bool {
    v == NAN_U64 || v == NAN_S64
}

pub fn dword(v: u32) -> u32 {
    if is_nan_dword(v) {
        0
    } else {
        v
    }
}

pub fn qword(v: u64) -> u64 {
    if is_nan_qword(v) {
        0
    } else {
        v
    }
}

/// Top byte of a record tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DataType {
    ULong = 0x00,
    Status = 0x08,
    Text = 0x10,
    Float = 0x20,
    SLong = 0x40,
    #[num_enum(catch_all)]
    Other(u8),
}

impl DataType {
    pub fn is_variable(&self) -> bool {
        matches!(self, DataType::Text | DataType::Status)
    }
}

/// Split record tag: `lri` is the register id with the class byte cleared.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tag {
    pub code: u32,
    pub lri: u32,
    pub class: u8,
    pub data_type: DataType,
}

impl Tag {
    pub fn new(code: u32) -> Self {
        Self {
            code,
            lri: code & 0x00FF_FF00,
            class: (code & 0xFF) as u8,
            data_type: DataType::from((code >> 24) as u8),
        }
    }

    /// Width of a record with this tag. Unknown registers fall back on the
    /// data type.
    pub fn record_width(&self) -> usize {
        match Lri::try_from(self.lri) {
            Ok(lri) => lri.record_width(),
            Err(_) if self.data_type.is_variable() => RECORD_TEXT,
            Err(_) => RECORD_DWORD,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Lri {
    OperationHealth = 0x0021_4800,
    CoolsysTmpNom = 0x0023_7700,
    DcMsWatt = 0x0025_1E00,
    MeteringTotWhOut = 0x0026_0100,
    MeteringDyWhOut = 0x0026_2200,
    GridMsTotW = 0x0026_3F00,
    BatChaStt = 0x0029_5A00,
    OperationHealthSttOk = 0x0041_1E00,
    OperationHealthSttWrn = 0x0041_1F00,
    OperationHealthSttAlm = 0x0041_2000,
    OperationGriSwStt = 0x0041_6400,
    DcMsVol = 0x0045_1F00,
    DcMsAmp = 0x0045_2100,
    MeteringTotOpTms = 0x0046_2E00,
    MeteringTotFeedTms = 0x0046_2F00,
    MeteringGridMsTotWOut = 0x0046_3600,
    MeteringGridMsTotWIn = 0x0046_3700,
    GridMsWphsA = 0x0046_4000,
    GridMsWphsB = 0x0046_4100,
    GridMsWphsC = 0x0046_4200,
    GridMsPhVphsA = 0x0046_4800,
    GridMsPhVphsB = 0x0046_4900,
    GridMsPhVphsC = 0x0046_4A00,
    GridMsAphsA = 0x0046_5300,
    GridMsAphsB = 0x0046_5400,
    GridMsAphsC = 0x0046_5500,
    GridMsHz = 0x0046_5700,
    BatDiagCapacThrpCnt = 0x0049_1E00,
    BatDiagTotAhIn = 0x0049_2600,
    BatDiagTotAhOut = 0x0049_2700,
    BatTmpVal = 0x0049_5B00,
    BatVol = 0x0049_5C00,
    BatAmp = 0x0049_5D00,
    NameplateLocation = 0x0082_1E00,
    NameplateMainModel = 0x0082_1F00,
    NameplateModel = 0x0082_2000,
    NameplatePkgRev = 0x0082_3400,
    InverterWLim = 0x0083_2A00,
}

impl Lri {
    pub fn is_64bit(&self) -> bool {
        matches!(
            self,
            Lri::MeteringTotWhOut
                | Lri::MeteringDyWhOut
                | Lri::MeteringTotOpTms
                | Lri::MeteringTotFeedTms
        )
    }

    pub fn is_variable(&self) -> bool {
        matches!(
            self,
            Lri::OperationHealth
                | Lri::OperationGriSwStt
                | Lri::NameplateLocation
                | Lri::NameplateMainModel
                | Lri::NameplateModel
        )
    }

    pub fn record_width(&self) -> usize {
        if self.is_64bit() {
            RECORD_QWORD
        } else if self.is_variable() {
            RECORD_TEXT
        } else {
            RECORD_DWORD
        }
    }
}

/// Logical data sets a poll cycle can ask for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DataSet {
    EnergyProduction,
    SpotDCPower,
    SpotDCVoltage,
    SpotACPower,
    SpotACVoltage,
    SpotGridFrequency,
    MaxACPower,
    MaxACPower2,
    SpotACTotalPower,
    TypeLabel,
    SoftwareVersion,
    DeviceStatus,
    GridRelayStatus,
    OperationTime,
    BatteryChargeStatus,
    BatteryInfo,
    InverterTemperature,
    MeteringGridMsTotW,
}

impl DataSet {
    /// (command, first register, last register)
    pub fn request(&self) -> (u32, u32, u32) {
        use DataSet::*;
        match self {
            EnergyProduction => (0x5400_0200, 0x0026_0100, 0x0026_22FF),
            SpotDCPower => (0x5380_0200, 0x0025_1E00, 0x0025_1EFF),
            SpotDCVoltage => (0x5380_0200, 0x0045_1F00, 0x0045_21FF),
            SpotACPower => (0x5100_0200, 0x0046_4000, 0x0046_42FF),
            SpotACVoltage => (0x5100_0200, 0x0046_4800, 0x0046_55FF),
            SpotGridFrequency => (0x5100_0200, 0x0046_5700, 0x0046_57FF),
            MaxACPower => (0x5100_0200, 0x0041_1E00, 0x0041_20FF),
            MaxACPower2 => (0x5100_0200, 0x0083_2A00, 0x0083_2AFF),
            SpotACTotalPower => (0x5100_0200, 0x0026_3F00, 0x0026_3FFF),
            TypeLabel => (0x5800_0200, 0x0082_1E00, 0x0082_20FF),
            SoftwareVersion => (0x5800_0200, 0x0082_3400, 0x0082_34FF),
            DeviceStatus => (0x5180_0200, 0x0021_4800, 0x0021_48FF),
            GridRelayStatus => (0x5180_0200, 0x0041_6400, 0x0041_64FF),
            OperationTime => (0x5400_0200, 0x0046_2E00, 0x0046_2FFF),
            BatteryChargeStatus => (0x5100_0200, 0x0029_5A00, 0x0029_5AFF),
            BatteryInfo => (0x5100_0200, 0x0049_1E00, 0x0049_5DFF),
            InverterTemperature => (0x5200_0200, 0x0023_7700, 0x0023_77FF),
            MeteringGridMsTotW => (0x5100_0200, 0x0046_3600, 0x0046_37FF),
        }
    }

    /// Registers a complete answer to this data set carries.
    pub fn lris(&self) -> &'static [Lri] {
        use DataSet::*;
        match self {
            EnergyProduction => &[Lri::MeteringTotWhOut, Lri::MeteringDyWhOut],
            SpotDCPower => &[Lri::DcMsWatt],
            SpotDCVoltage => &[Lri::DcMsVol, Lri::DcMsAmp],
            SpotACPower => &[Lri::GridMsWphsA, Lri::GridMsWphsB, Lri::GridMsWphsC],
            SpotACVoltage => &[
                Lri::GridMsPhVphsA,
                Lri::GridMsPhVphsB,
                Lri::GridMsPhVphsC,
                Lri::GridMsAphsA,
                Lri::GridMsAphsB,
                Lri::GridMsAphsC,
            ],
            SpotGridFrequency => &[Lri::GridMsHz],
            MaxACPower => &[
                Lri::OperationHealthSttOk,
                Lri::OperationHealthSttWrn,
                Lri::OperationHealthSttAlm,
            ],
            MaxACPower2 => &[Lri::InverterWLim],
            SpotACTotalPower => &[Lri::GridMsTotW],
            TypeLabel => &[
                Lri::NameplateLocation,
                Lri::NameplateMainModel,
                Lri::NameplateModel,
            ],
            SoftwareVersion => &[Lri::NameplatePkgRev],
            DeviceStatus => &[Lri::OperationHealth],
            GridRelayStatus => &[Lri::OperationGriSwStt],
            OperationTime => &[Lri::MeteringTotOpTms, Lri::MeteringTotFeedTms],
            BatteryChargeStatus => &[Lri::BatChaStt],
            BatteryInfo => &[Lri::BatTmpVal, Lri::BatVol, Lri::BatAmp],
            InverterTemperature => &[Lri::CoolsysTmpNom],
            MeteringGridMsTotW => &[Lri::MeteringGridMsTotWOut, Lri::MeteringGridMsTotWIn],
        }
    }

    /// Data sets polled for a device of the given class, in request order.
    pub fn for_class(class: DeviceClass) -> Vec<DataSet> {
        use DataSet::*;
        let mut sets = vec![TypeLabel, SoftwareVersion, DeviceStatus];

        match class {
            DeviceClass::CommunicationProduct | DeviceClass::EnergyMeter => {}
            DeviceClass::BatteryInverter => sets.extend([
                GridRelayStatus,
                OperationTime,
                EnergyProduction,
                SpotACPower,
                SpotACVoltage,
                SpotGridFrequency,
                SpotACTotalPower,
                BatteryChargeStatus,
                BatteryInfo,
                MeteringGridMsTotW,
            ]),
            _ => sets.extend([
                GridRelayStatus,
                MaxACPower,
                MaxACPower2,
                OperationTime,
                EnergyProduction,
                SpotDCPower,
                SpotDCVoltage,
                SpotACPower,
                SpotACVoltage,
                SpotGridFrequency,
                SpotACTotalPower,
                InverterTemperature,
            ]),
        }

        sets
    }
}
