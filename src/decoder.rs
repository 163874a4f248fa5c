//! Decoder for BF 915 measurement notifications.
//!
//! The frame layout is reverse-engineered and shifts between firmware
//! revisions, so there is no fixed schema. Instead the decoder scans a few
//! candidate layouts in a fixed priority order and keeps the first value that
//! passes a plausibility window:
//!
//! - weight: little-endian `u16 / 10` at the first of [`WEIGHT_OFFSETS`]
//!   landing in [`WEIGHT_RANGE_KG`]
//! - user: first byte at [`USER_ID_OFFSETS`] naming a roster id, else the
//!   roster's lowest id
//! - body fat, water, muscle: consecutive `u16 / 10` right after the weight,
//!   each accepted independently when in [`PERCENT_RANGE`]
//!
//! Everything here is pure. Callers log and store the result.

use crate::config::Roster;
use crate::store::{MeasurementUpdate, PERCENT_RANGE, WEIGHT_RANGE_KG};

/// Frames shorter than this are noise or partial notifications.
pub const MIN_FRAME_LEN: usize = 10;

/// Weight offsets in priority order. First plausible match wins.
pub const WEIGHT_OFFSETS: [usize; 6] = [7, 8, 6, 4, 5, 9];

/// User-id offsets in priority order. First roster match wins.
pub const USER_ID_OFFSETS: [usize; 4] = [2, 3, 1, 0];

/// Extended fields are only read when the frame reaches this far past the
/// weight offset.
pub const EXTENDED_SPAN: usize = 10;

/// How one secondary field fared in a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldOutcome {
    Accepted(f64),
    /// Decoded but outside the plausibility window.
    OutOfRange(f64),
    /// Not enough bytes, or the frame was too short for extended fields.
    Absent,
}

impl FieldOutcome {
    pub fn accepted(self) -> Option<f64> {
        match self {
            FieldOutcome::Accepted(v) => Some(v),
            _ => None,
        }
    }
}

/// Where the user id of a reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    Matched { offset: usize },
    Fallback,
}

/// A weight reading and whatever came with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub user_id: u8,
    pub attribution: Attribution,
    pub weight_offset: usize,
    pub weight_kg: f64,
    pub bmi: f64,
    pub body_fat: FieldOutcome,
    pub water: FieldOutcome,
    pub muscle: FieldOutcome,
}

impl Reading {
    /// Store update carrying only the validated fields.
    pub fn update(&self) -> MeasurementUpdate {
        MeasurementUpdate {
            weight_kg: Some(self.weight_kg),
            bmi: Some(self.bmi),
            body_fat_pct: self.body_fat.accepted(),
            water_pct: self.water.accepted(),
            muscle_pct: self.muscle.accepted(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    TooShort { len: usize },
    NoWeight,
    Reading(Reading),
}

pub fn decode_frame(data: &[u8], roster: &Roster) -> Decoded {
    if data.len() < MIN_FRAME_LEN {
        return Decoded::TooShort { len: data.len() };
    }

    let Some((weight_offset, weight_kg)) = find_weight(data) else {
        return Decoded::NoWeight;
    };

    let (user_id, attribution) = match find_user(data, roster) {
        Some((offset, id)) => (id, Attribution::Matched { offset }),
        None => (roster.fallback_id(), Attribution::Fallback),
    };

    let bmi = roster
        .get(user_id)
        .map(|p| body_mass_index(weight_kg, p.height_cm))
        .unwrap_or(0.0);

    let (body_fat, water, muscle) = if weight_offset + EXTENDED_SPAN <= data.len() {
        let base = weight_offset + 2;
        (
            percent_at(data, base),
            percent_at(data, base + 2),
            percent_at(data, base + 4),
        )
    } else {
        (FieldOutcome::Absent, FieldOutcome::Absent, FieldOutcome::Absent)
    };

    Decoded::Reading(Reading {
        user_id,
        attribution,
        weight_offset,
        weight_kg,
        bmi,
        body_fat,
        water,
        muscle,
    })
}

/// `weight / height_m²`, rounded to one decimal. Zero height yields zero.
pub fn body_mass_index(weight_kg: f64, height_cm: u8) -> f64 {
    if height_cm == 0 {
        return 0.0;
    }
    let height_m = f64::from(height_cm) / 100.0;
    round_tenth(weight_kg / (height_m * height_m))
}

fn find_weight(data: &[u8]) -> Option<(usize, f64)> {
    WEIGHT_OFFSETS.iter().find_map(|&offset| {
        let weight = tenths_at(data, offset)?;
        WEIGHT_RANGE_KG.contains(&weight).then_some((offset, weight))
    })
}

fn find_user(data: &[u8], roster: &Roster) -> Option<(usize, u8)> {
    USER_ID_OFFSETS.iter().find_map(|&offset| {
        let id = *data.get(offset)?;
        roster.contains(id).then_some((offset, id))
    })
}

fn percent_at(data: &[u8], offset: usize) -> FieldOutcome {
    match tenths_at(data, offset) {
        Some(v) if PERCENT_RANGE.contains(&v) => FieldOutcome::Accepted(v),
        Some(v) => FieldOutcome::OutOfRange(v),
        None => FieldOutcome::Absent,
    }
}

fn tenths_at(data: &[u8], offset: usize) -> Option<f64> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    let raw = u16::from_le_bytes([bytes[0], bytes[1]]);
    Some(f64::from(raw) / 10.0)
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
