use crate::prelude::*;
use crate::sma::records::ArchiveSample;

use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Utc};

pub const DAY_SLOTS: usize = 288;
pub const MONTH_SLOTS: usize = 31;
pub const SLOT_SECS: i64 = 300;
pub const DAY_SECS: i64 = 86_400;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DaySlot {
    pub timestamp: i64,
    pub total_wh: u64,
    pub watt: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MonthSlot {
    pub timestamp: i64,
    pub total_wh: u64,
    pub day_wh: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DayArchive {
    pub date: NaiveDate,
    pub slots: Vec<DaySlot>,
    pub has_data: bool,
    pub missing_records: u32,
}

impl DayArchive {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            slots: vec![DaySlot::default(); DAY_SLOTS],
            has_data: false,
            missing_records: 0,
        }
    }

    pub fn filled(&self) -> impl Iterator<Item = (usize, &DaySlot)> {
        self.slots.iter().enumerate().filter(|(_, s)| s.timestamp != 0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonthArchive {
    pub year: i32,
    pub month: u32,
    pub slots: Vec<MonthSlot>,
    pub has_data: bool,
}

impl MonthArchive {
    pub fn new(year: i32, month: u32) -> Self {
        Self {
            year,
            month,
            slots: vec![MonthSlot::default(); MONTH_SLOTS],
            has_data: false,
        }
    }

    pub fn filled(&self) -> impl Iterator<Item = (usize, &MonthSlot)> {
        self.slots.iter().enumerate().filter(|(_, s)| s.timestamp != 0)
    }
}

// {{{ windows
/// Unix time of local midnight starting `date`.
///
/// Anchored on midnight of the following day and stepped back one day, so a
/// daylight saving change during `date` shifts the window rather than
/// cutting off its end.
pub fn day_start<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Result<i64> {
    let next = date
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| ProtocolError::BadArgument(format!("no day after {}", date)))?;

    let midnight = tz
        .from_local_datetime(&next)
        .earliest()
        .ok_or_else(|| ProtocolError::BadArgument(format!("no local midnight on {}", next)))?;

    Ok(midnight.timestamp() - DAY_SECS)
}

/// Request bounds for a day archive: 5 minutes before midnight up to 23:55.
pub fn day_window(day_start: i64) -> (u32, u32) {
    ((day_start - SLOT_SECS) as u32, (day_start + DAY_SECS - SLOT_SECS) as u32)
}

pub fn month_start(year: i32, month: u32) -> Result<i64> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp())
        .ok_or_else(|| ProtocolError::BadArgument(format!("invalid month {}-{}", year, month)).into())
}

/// Request bounds for a month archive, padded so the last sample of the
/// previous month serves as baseline.
pub fn month_window(month_start: i64) -> (u32, u32) {
    ((month_start - 2 * DAY_SECS) as u32, (month_start + 32 * DAY_SECS) as u32)
}

/// (first, last) second of a calendar month, for event archive requests.
pub fn event_window(year: i32, month: u32) -> Result<(u32, u32)> {
    let (next_year, next_month) = next_month(year, month);
    let from = month_start(year, month)?;
    let to = month_start(next_year, next_month)? - 1;
    Ok((from as u32, to as u32))
}

pub fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month >= 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

pub fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month <= 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

/// Correction applied to month archive timestamps. Some devices stamp the
/// day total at the end of the day it belongs to; if the newest sample is
/// already dated today, every timestamp is one day late.
pub fn month_data_offset(latest_sample: i64, now: i64) -> i64 {
    let day_of_year = |t: i64| Utc.timestamp_opt(t, 0).single().map(|d| (d.year(), d.ordinal()));

    match (day_of_year(latest_sample), day_of_year(now)) {
        (Some(a), Some(b)) if a == b => -DAY_SECS,
        _ => 0,
    }
}
// }}}

// {{{ DayReconstructor
/// Turns a stream of (timestamp, cumulative Wh) samples into 5-minute slots
/// of one local day.
pub struct DayReconstructor<Tz: TimeZone> {
    tz: Tz,
    archive: DayArchive,
    previous: Option<ArchiveSample>,
    // sample before `previous`; twins are measured against this one
    baseline: Option<ArchiveSample>,
    previous_slot: Option<usize>,
}

impl<Tz: TimeZone> DayReconstructor<Tz> {
    pub fn new(date: NaiveDate, tz: Tz) -> Self {
        Self {
            tz,
            archive: DayArchive::new(date),
            previous: None,
            baseline: None,
            previous_slot: None,
        }
    }

    fn slot_of(&self, timestamp: i64) -> Option<usize> {
        let local = self.tz.timestamp_opt(timestamp, 0).single()?;
        if local.date_naive() != self.archive.date {
            return None;
        }
        let idx = (local.hour() * 12 + local.minute() / 5) as usize;
        (idx < DAY_SLOTS).then_some(idx)
    }

    fn watt(sample: &ArchiveSample, baseline: Option<ArchiveSample>) -> i64 {
        match baseline {
            Some(b) => {
                let dt = sample.timestamp as i64 - b.timestamp as i64;
                if dt <= 0 {
                    return 0;
                }
                (sample.total_wh as i64 - b.total_wh as i64) * 3600 / dt
            }
            None => 0,
        }
    }

    fn write(&mut self, idx: usize, sample: &ArchiveSample, watt: i64) {
        self.archive.slots[idx] = DaySlot {
            timestamp: sample.timestamp as i64,
            total_wh: sample.total_wh,
            watt,
        };
        if sample.total_wh > 0 {
            self.archive.has_data = true;
        }
    }

    pub fn push(&mut self, sample: ArchiveSample) {
        if sample.is_nan() {
            trace!("skipping unavailable sample at {}", sample.timestamp);
            return;
        }

        // twin: same timestamp again, replaces the sample just written
        if let Some(prev) = self.previous {
            if prev.timestamp == sample.timestamp {
                if let Some(idx) = self.previous_slot {
                    let watt = Self::watt(&sample, self.baseline);
                    self.write(idx, &sample, watt);
                }
                self.previous = Some(sample);
                return;
            }

            let gap = sample.timestamp as i64 - prev.timestamp as i64;
            if gap > SLOT_SECS {
                self.archive.missing_records += 1;
                warn!(
                    "day archive {}: {} seconds without records before {}",
                    self.archive.date, gap, sample.timestamp
                );
            }
        }

        self.previous_slot = self.slot_of(sample.timestamp as i64);
        if let Some(idx) = self.previous_slot {
            let watt = Self::watt(&sample, self.previous);
            self.write(idx, &sample, watt);
        }

        self.baseline = self.previous;
        self.previous = Some(sample);
    }

    pub fn finish(self) -> DayArchive {
        self.archive
    }
} // }}}

// {{{ MonthReconstructor
/// Turns daily cumulative samples into per-day slots of one UTC month.
pub struct MonthReconstructor {
    archive: MonthArchive,
    offset: i64,
    previous: Option<ArchiveSample>,
    index: usize,
}

impl MonthReconstructor {
    pub fn new(year: i32, month: u32, offset: i64) -> Self {
        Self {
            archive: MonthArchive::new(year, month),
            offset,
            previous: None,
            index: 0,
        }
    }

    pub fn push(&mut self, sample: ArchiveSample) {
        if sample.is_nan() {
            return;
        }

        let timestamp = sample.timestamp as i64 + self.offset;
        let in_month = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .map(|d| d.year() == self.archive.year && d.month() == self.archive.month)
            .unwrap_or(false);

        if let Some(prev) = self.previous {
            if in_month && self.index < MONTH_SLOTS {
                self.archive.slots[self.index] = MonthSlot {
                    timestamp,
                    total_wh: sample.total_wh,
                    day_wh: sample.total_wh.saturating_sub(prev.total_wh),
                };
                self.index += 1;
                if sample.total_wh > 0 {
                    self.archive.has_data = true;
                }
            }
        }

        self.previous = Some(sample);
    }

    pub fn finish(self) -> MonthArchive {
        self.archive
    }
} // }}}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sma::lri::NAN_U64;

    fn sample(timestamp: i64, total_wh: u64) -> ArchiveSample {
        ArchiveSample {
            timestamp: timestamp as u32,
            total_wh,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    #[test]
    fn day_window_brackets_midnight() {
        let start = day_start(date(), &Utc).unwrap();
        assert_eq!(start, 1_718_409_600);
        assert_eq!(day_window(start), (1_718_409_300, 1_718_495_700));
    }

    #[test]
    fn power_is_derived_from_energy_delta() {
        let start = day_start(date(), &Utc).unwrap();
        let mut day = DayReconstructor::new(date(), Utc);
        day.push(sample(start, 1000));
        day.push(sample(start + 300, 1150));
        let archive = day.finish();

        assert_eq!(archive.slots[0].watt, 0);
        assert_eq!(archive.slots[1].watt, 1800);
        assert_eq!(archive.slots[1].total_wh, 1150);
        assert!(archive.has_data);
        assert_eq!(archive.missing_records, 0);
    }

    #[test]
    fn twin_overwrites_slot() {
        let start = day_start(date(), &Utc).unwrap();
        let mut day = DayReconstructor::new(date(), Utc);
        day.push(sample(start, 1000));
        day.push(sample(start + 300, 1150));
        day.push(sample(start + 300, 1200));
        let archive = day.finish();

        assert_eq!(archive.filled().count(), 2);
        assert_eq!(archive.slots[1].total_wh, 1200);
        assert_eq!(archive.slots[1].watt, 2400);
        assert_eq!(archive.slots[2], DaySlot::default());
    }

    #[test]
    fn nan_sample_is_not_a_baseline() {
        let start = day_start(date(), &Utc).unwrap();
        let mut day = DayReconstructor::new(date(), Utc);
        day.push(sample(start, 1000));
        day.push(sample(start + 300, NAN_U64));
        day.push(sample(start + 600, 1300));
        let archive = day.finish();

        assert_eq!(archive.slots[1], DaySlot::default());
        // measured against t=0, not against the unavailable sample
        assert_eq!(archive.slots[2].watt, 1800);
        assert_eq!(archive.missing_records, 1);
    }

    #[test]
    fn samples_outside_the_day_only_serve_as_baseline() {
        let start = day_start(date(), &Utc).unwrap();
        let mut day = DayReconstructor::new(date(), Utc);
        day.push(sample(start - 300, 900));
        day.push(sample(start, 1000));
        day.push(sample(start + DAY_SECS, 5000));
        let archive = day.finish();

        assert_eq!(archive.slots[0].watt, 1200);
        assert_eq!(archive.filled().count(), 1);
    }

    #[test]
    fn gaps_count_missing_records() {
        let start = day_start(date(), &Utc).unwrap();
        let mut day = DayReconstructor::new(date(), Utc);
        day.push(sample(start, 1000));
        day.push(sample(start + 1200, 1100));
        let archive = day.finish();

        assert_eq!(archive.missing_records, 1);
        assert_eq!(archive.slots[4].watt, 300);
    }

    #[test]
    fn month_slots_need_a_baseline() {
        let start = month_start(2024, 6).unwrap();
        let mut month = MonthReconstructor::new(2024, 6, 0);
        month.push(sample(start - DAY_SECS, 10_000));
        month.push(sample(start, 12_000));
        month.push(sample(start + DAY_SECS, 15_500));
        month.push(sample(start + 30 * DAY_SECS, 16_000));
        let archive = month.finish();

        assert_eq!(archive.filled().count(), 2);
        assert_eq!(archive.slots[0].day_wh, 2_000);
        assert_eq!(archive.slots[1].day_wh, 3_500);
        assert!(archive.has_data);
    }

    #[test]
    fn month_offset_shifts_timestamps() {
        let start = month_start(2024, 6).unwrap();
        let mut month = MonthReconstructor::new(2024, 6, -DAY_SECS);
        month.push(sample(start, 10_000));
        month.push(sample(start + DAY_SECS, 12_000));
        let archive = month.finish();

        assert_eq!(archive.slots[0].timestamp, start);
        assert_eq!(archive.slots[0].day_wh, 2_000);
    }

    #[test]
    fn month_offset_detection() {
        let now = 1_718_454_000; // 2024-06-15 12:20 UTC
        assert_eq!(month_data_offset(1_718_409_600, now), -86_400);
        assert_eq!(month_data_offset(1_718_409_600 - 1, now), 0);
    }

    #[test]
    fn month_arithmetic() {
        assert_eq!(previous_month(2024, 1), (2023, 12));
        assert_eq!(next_month(2024, 12), (2025, 1));
        let (from, to) = event_window(2024, 2).unwrap();
        assert_eq!(to - from + 1, 29 * 86_400);
    }
}
