use crate::prelude::*;
use crate::sma::lri::{self, DataType, Lri, Tag, RECORD_ARCHIVE};
use crate::sma::packet::RECORDS_OFFSET;

use nom_derive::{Nom, Parse};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

// {{{ LiveSnapshot
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AcPhase {
    pub power: i32,
    pub voltage: f64,
    pub current: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DcInput {
    pub power: i32,
    pub voltage: f64,
    pub current: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BatterySnapshot {
    pub charge_status: u32,
    pub temperature: f64,
    pub voltage: f64,
    pub current: f64,
    pub charge_cycles: u32,
    pub amp_hours_in: u32,
    pub amp_hours_out: u32,
}

/// Instantaneous readings of one device, refreshed every poll cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LiveSnapshot {
    /// Newest record timestamp seen this cycle.
    pub timestamp: i64,

    pub device_name: String,
    pub device_class: u32,
    pub device_type: u32,
    pub software_version: String,
    pub device_status: u32,
    pub grid_relay_status: u32,

    pub pmax: [u32; 3],
    pub power_limit: u32,

    pub ac: [AcPhase; 3],
    pub pac_total: i32,
    pub grid_frequency: f64,

    pub dc: [DcInput; 2],
    pub pdc_total: i32,
    pub efficiency: f64,

    pub e_today: u64,
    pub e_total: u64,
    pub operation_time: u64,
    pub feed_in_time: u64,

    pub temperature: f64,
    pub metering_power_out: u32,
    pub metering_power_in: u32,

    pub battery: BatterySnapshot,

    #[serde(skip)]
    pub pac_reported: bool,
}

impl LiveSnapshot {
    /// Fills in the totals a device does not report itself.
    pub fn derive_totals(&mut self) {
        self.pdc_total = self.dc.iter().map(|d| d.power).sum();

        if !self.pac_reported {
            self.pac_total = self.ac.iter().map(|p| p.power).sum();
        }

        self.efficiency = if self.pdc_total > 0 {
            self.pac_total as f64 * 100.0 / self.pdc_total as f64
        } else {
            0.0
        };
    }

    /// Clears the per-cycle values while keeping nameplate data.
    pub fn reset_readings(&mut self) {
        *self = Self {
            device_name: std::mem::take(&mut self.device_name),
            device_class: self.device_class,
            device_type: self.device_type,
            software_version: std::mem::take(&mut self.software_version),
            ..Self::default()
        };
    }
} // }}}

// {{{ Record
/// One tagged record, borrowed from the payload.
pub struct Record<'a> {
    pub tag: Tag,
    pub timestamp: u32,
    bytes: &'a [u8],
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    bytes
        .get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

impl<'a> Record<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            tag: Tag::new(u32_at(bytes, 0)),
            timestamp: u32_at(bytes, 4),
            bytes,
        }
    }

    /// Raw 32-bit value with sentinels mapped to zero.
    pub fn dword(&self) -> u32 {
        lri::dword(u32_at(self.bytes, 16))
    }

    pub fn signed(&self) -> i32 {
        self.dword() as i32
    }

    /// Value in the record's own data type, as a float.
    pub fn value(&self) -> f64 {
        match self.tag.data_type {
            DataType::SLong => self.signed() as f64,
            DataType::Float => f32::from_bits(self.dword()) as f64,
            _ => self.dword() as f64,
        }
    }

    pub fn qword(&self) -> u64 {
        lri::qword(u64_at(self.bytes, 8))
    }

    pub fn text(&self) -> String {
        let raw = self.bytes.get(8..40).unwrap_or(&[]);
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).trim().to_string()
    }

    /// The selected entry of an attribute list.
    pub fn attribute(&self) -> Option<u32> {
        const END: u32 = 0x00FF_FFFE;

        let mut offset = 8;
        while offset + 4 <= self.bytes.len() {
            let entry = u32_at(self.bytes, offset);
            let attribute = entry & 0x00FF_FFFF;
            if attribute == END {
                break;
            }
            if entry >> 24 == 1 {
                return Some(attribute);
            }
            offset += 4;
        }
        None
    }

    pub fn software_version(&self) -> String {
        let b = |i: usize| self.bytes.get(i).copied().unwrap_or(0);
        let (kind, build, minor, major) = (b(24), b(25), b(26), b(27));

        let release = match kind {
            0..=5 => "NEABRS"
                .chars()
                .nth(kind as usize)
                .map(String::from)
                .unwrap_or_default(),
            _ => kind.to_string(),
        };

        format!(
            "{}{}.{}{}.{:02}.{}",
            major >> 4,
            major & 0x0F,
            minor >> 4,
            minor & 0x0F,
            build,
            release
        )
    }
} // }}}

// {{{ field table
type Apply = fn(&mut LiveSnapshot, &Record);

pub struct Field {
    pub width: usize,
    pub apply: Apply,
}

fn phase(lri: Lri) -> usize {
    use Lri::*;
    match lri {
        GridMsWphsB | GridMsPhVphsB | GridMsAphsB => 1,
        GridMsWphsC | GridMsPhVphsC | GridMsAphsC => 2,
        _ => 0,
    }
}

// DC input selected by the record class byte
fn dc_input<'s>(s: &'s mut LiveSnapshot, r: &Record) -> Option<&'s mut DcInput> {
    match r.tag.class {
        1 => Some(&mut s.dc[0]),
        2 => Some(&mut s.dc[1]),
        _ => None,
    }
}

fn apply_fn(lri: Lri) -> Apply {
    use Lri::*;
    match lri {
        OperationHealth => |s, r| {
            if let Some(a) = r.attribute() {
                s.device_status = a
            }
        },
        OperationGriSwStt => |s, r| {
            if let Some(a) = r.attribute() {
                s.grid_relay_status = a
            }
        },
        NameplateLocation => |s, r| s.device_name = r.text(),
        NameplateMainModel => |s, r| {
            if let Some(a) = r.attribute() {
                s.device_class = a
            }
        },
        NameplateModel => |s, r| {
            if let Some(a) = r.attribute() {
                s.device_type = a
            }
        },
        NameplatePkgRev => |s, r| s.software_version = r.software_version(),

        MeteringTotWhOut => |s, r| s.e_total = r.qword(),
        MeteringDyWhOut => |s, r| s.e_today = r.qword(),
        MeteringTotOpTms => |s, r| s.operation_time = r.qword(),
        MeteringTotFeedTms => |s, r| s.feed_in_time = r.qword(),

        GridMsTotW => |s, r| {
            s.pac_total = r.signed();
            s.pac_reported = true;
        },
        GridMsWphsA | GridMsWphsB | GridMsWphsC => |s, r| {
            if let Ok(lri) = Lri::try_from(r.tag.lri) {
                s.ac[phase(lri)].power = r.signed();
            }
        },
        GridMsPhVphsA | GridMsPhVphsB | GridMsPhVphsC => |s, r| {
            if let Ok(lri) = Lri::try_from(r.tag.lri) {
                s.ac[phase(lri)].voltage = r.value() / 100.0;
            }
        },
        GridMsAphsA | GridMsAphsB | GridMsAphsC => |s, r| {
            if let Ok(lri) = Lri::try_from(r.tag.lri) {
                s.ac[phase(lri)].current = r.value() / 1000.0;
            }
        },
        GridMsHz => |s, r| s.grid_frequency = r.value() / 100.0,

        DcMsWatt => |s, r| {
            let v = r.signed();
            if let Some(dc) = dc_input(s, r) {
                dc.power = v
            }
        },
        DcMsVol => |s, r| {
            let v = r.value() / 100.0;
            if let Some(dc) = dc_input(s, r) {
                dc.voltage = v
            }
        },
        DcMsAmp => |s, r| {
            let v = r.value() / 1000.0;
            if let Some(dc) = dc_input(s, r) {
                dc.current = v
            }
        },

        OperationHealthSttOk => |s, r| s.pmax[0] = r.dword(),
        OperationHealthSttWrn => |s, r| s.pmax[1] = r.dword(),
        OperationHealthSttAlm => |s, r| s.pmax[2] = r.dword(),
        InverterWLim => |s, r| s.power_limit = r.dword(),

        CoolsysTmpNom => |s, r| s.temperature = r.value() / 100.0,
        MeteringGridMsTotWOut => |s, r| s.metering_power_out = r.dword(),
        MeteringGridMsTotWIn => |s, r| s.metering_power_in = r.dword(),

        BatChaStt => |s, r| s.battery.charge_status = r.dword(),
        BatDiagCapacThrpCnt => |s, r| s.battery.charge_cycles = r.dword(),
        BatDiagTotAhIn => |s, r| s.battery.amp_hours_in = r.dword(),
        BatDiagTotAhOut => |s, r| s.battery.amp_hours_out = r.dword(),
        BatTmpVal => |s, r| s.battery.temperature = r.value() / 100.0,
        BatVol => |s, r| s.battery.voltage = r.value() / 100.0,
        BatAmp => |s, r| s.battery.current = r.value() / 1000.0,
    }
}

const ALL_LRIS: [Lri; 38] = {
    use Lri::*;
    [
        OperationHealth, CoolsysTmpNom, DcMsWatt, MeteringTotWhOut, MeteringDyWhOut,
        GridMsTotW, BatChaStt, OperationHealthSttOk, OperationHealthSttWrn,
        OperationHealthSttAlm, OperationGriSwStt, DcMsVol, DcMsAmp, MeteringTotOpTms,
        MeteringTotFeedTms, MeteringGridMsTotWOut, MeteringGridMsTotWIn, GridMsWphsA,
        GridMsWphsB, GridMsWphsC, GridMsPhVphsA, GridMsPhVphsB, GridMsPhVphsC, GridMsAphsA,
        GridMsAphsB, GridMsAphsC, GridMsHz, BatDiagCapacThrpCnt, BatDiagTotAhIn,
        BatDiagTotAhOut, BatTmpVal, BatVol, BatAmp, NameplateLocation, NameplateMainModel,
        NameplateModel, NameplatePkgRev, InverterWLim,
    ]
};

/// Register id -> (record width, setter), built on first use.
pub fn field_table() -> &'static HashMap<u32, Field> {
    static TABLE: OnceLock<HashMap<u32, Field>> = OnceLock::new();
    TABLE.get_or_init(|| {
        ALL_LRIS
            .iter()
            .map(|lri| {
                (
                    u32::from(*lri),
                    Field {
                        width: lri.record_width(),
                        apply: apply_fn(*lri),
                    },
                )
            })
            .collect()
    })
} // }}}

/// Walks the tagged records of a reply payload into `snapshot`.
///
/// The record width is taken from the first record and held for the rest of
/// the payload. Every register id that was applied is removed from `pending`
/// and returned.
pub fn decode(
    payload: &[u8],
    snapshot: &mut LiveSnapshot,
    pending: &mut HashSet<u32>,
) -> Result<Vec<u32>> {
    let records = payload.get(RECORDS_OFFSET..).unwrap_or(&[]);
    let table = field_table();

    let mut applied = Vec::new();
    let mut width: Option<usize> = None;
    let mut offset = 0;

    while offset + 8 <= records.len() {
        let tag = Tag::new(u32_at(records, offset));
        let width = *width.get_or_insert_with(|| match table.get(&tag.lri) {
            Some(field) => field.width,
            None => tag.record_width(),
        });

        let Some(bytes) = records.get(offset..offset + width) else {
            warn!(
                "record {:#010x} truncated at offset {} ({} of {} bytes)",
                tag.code,
                offset,
                records.len() - offset,
                width
            );
            break;
        };
        let record = Record::new(bytes);

        match table.get(&tag.lri) {
            Some(field) => {
                (field.apply)(snapshot, &record);
                snapshot.timestamp = snapshot.timestamp.max(record.timestamp as i64);
                pending.remove(&tag.lri);
                if !applied.contains(&tag.lri) {
                    applied.push(tag.lri);
                }
            }
            None => debug!("skipping unknown register {:#010x}", tag.code),
        }

        offset += width;
    }

    Ok(applied)
}

// {{{ archive, event and gateway layouts
/// One (timestamp, cumulative Wh) pair from a day or month archive reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Nom)]
#[nom(LittleEndian)]
pub struct ArchiveSample {
    pub timestamp: u32,
    pub total_wh: u64,
}

impl ArchiveSample {
    pub fn is_nan(&self) -> bool {
        lri::is_nan_qword(self.total_wh)
    }

    pub fn parse_all(payload: &[u8]) -> Vec<Self> {
        payload
            .get(RECORDS_OFFSET..)
            .unwrap_or(&[])
            .chunks_exact(RECORD_ARCHIVE)
            .filter_map(|chunk| Self::parse(chunk).ok().map(|(_, s)| s))
            .collect()
    }
}

pub const EVENT_RECORD: usize = 48;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Nom)]
#[nom(LittleEndian)]
pub struct EventRecord {
    pub datetime: u32,
    pub entry_id: u16,
    pub susy_id: u16,
    pub serial: u32,
    pub event_code: u16,
    pub event_flags: u16,
    pub group: u32,
    pub reserved: u32,
    pub tag: u32,
    pub counter: u32,
    pub dt_change: u32,
    pub parameter: u32,
    pub new_value: u32,
    pub old_value: u32,
}

impl EventRecord {
    pub fn parse_all(payload: &[u8]) -> Vec<Self> {
        payload
            .get(RECORDS_OFFSET..)
            .unwrap_or(&[])
            .chunks_exact(EVENT_RECORD)
            .filter_map(|chunk| Self::parse(chunk).ok().map(|(_, e)| e))
            .filter(|e| e.datetime != 0)
            .collect()
    }

    /// The oldest record a device can hold.
    pub fn is_first(&self) -> bool {
        self.entry_id == 1
    }
}

pub const CHILD_ENTRY: usize = 8;

/// A device attached behind a gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Nom)]
#[nom(LittleEndian)]
pub struct ChildEntry {
    pub susy_id: u16,
    pub serial: u32,
    pub class_offset: u16,
}

impl ChildEntry {
    pub fn identity(&self) -> Identity {
        Identity::new(self.susy_id, self.serial)
    }

    pub fn class(&self) -> DeviceClass {
        DeviceClass::from(8000 + self.class_offset as u32)
    }

    pub fn parse_all(payload: &[u8]) -> Vec<Self> {
        payload
            .get(RECORDS_OFFSET..)
            .unwrap_or(&[])
            .chunks_exact(CHILD_ENTRY)
            .filter_map(|chunk| Self::parse(chunk).ok().map(|(_, c)| c))
            .filter(|c| c.serial != 0 && c.serial != lri::NAN_U32)
            .collect()
    }
} // }}}
