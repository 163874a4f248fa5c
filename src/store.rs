//! Latest-value cache of body-composition readings, one entry per user.
//!
//! Entries are created up front for every roster id and never removed. An
//! update only overwrites the fields it carries, and only when the value
//! passes the same plausibility windows the decoder uses; everything else
//! keeps its previous value.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Roster;

/// Plausible weights, in kilograms.
pub const WEIGHT_RANGE_KG: RangeInclusive<f64> = 2.0..=300.0;

/// Plausible body-fat, water and muscle percentages.
pub const PERCENT_RANGE: RangeInclusive<f64> = 0.1..=80.0;

/// Per-user mapping handed out to readers.
pub type Measurements = BTreeMap<u8, MeasurementSnapshot>;

/// Last known values for one user. Zero means "never measured".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeasurementSnapshot {
    /// When `weight_kg` was last updated.
    pub timestamp: Option<DateTime<Utc>>,
    pub weight_kg: f64,
    pub body_fat_pct: f64,
    pub water_pct: f64,
    pub muscle_pct: f64,
    pub bone_mass_kg: f64,
    pub bmi: f64,
    pub bmr_kcal: u32,
    pub amr_kcal: u32,
    pub visceral_fat: u16,
    pub metabolic_age: u16,
    /// Vendor body-type code, 0 when unknown.
    pub body_type: u8,
}

/// Fields carried by one decoded frame. `None` means "no new information".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementUpdate {
    pub weight_kg: Option<f64>,
    /// Only honoured together with a valid `weight_kg`.
    pub bmi: Option<f64>,
    pub body_fat_pct: Option<f64>,
    pub water_pct: Option<f64>,
    pub muscle_pct: Option<f64>,
    // No known frame layout carries the fields below yet; the decoder
    // leaves them `None` and the store keeps them at zero.
    pub bone_mass_kg: Option<f64>,
    pub bmr_kcal: Option<u32>,
    pub amr_kcal: Option<u32>,
    pub visceral_fat: Option<u16>,
    pub metabolic_age: Option<u16>,
    pub body_type: Option<u8>,
}

impl MeasurementUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementStore {
    entries: Measurements,
}

impl MeasurementStore {
    /// One default snapshot per roster id.
    pub fn new(roster: &Roster) -> Self {
        let entries = roster
            .iter()
            .map(|p| (p.id, MeasurementSnapshot::default()))
            .collect();
        Self { entries }
    }

    pub fn get(&self, user_id: u8) -> Option<&MeasurementSnapshot> {
        self.entries.get(&user_id)
    }

    /// Owned copy of every entry.
    pub fn snapshot_all(&self) -> Measurements {
        self.entries.clone()
    }

    pub fn apply(&mut self, user_id: u8, update: &MeasurementUpdate) -> bool {
        self.apply_at(user_id, update, Utc::now())
    }

    /// Merge `update` into the user's entry, stamping it with `now` if the
    /// weight changed. Returns `false` for ids outside the roster.
    pub fn apply_at(&mut self, user_id: u8, update: &MeasurementUpdate, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.entries.get_mut(&user_id) else {
            return false;
        };

        if let Some(weight) = update.weight_kg.filter(|w| WEIGHT_RANGE_KG.contains(w)) {
            entry.weight_kg = weight;
            entry.timestamp = Some(now);
            if let Some(bmi) = update.bmi.filter(|b| b.is_finite() && *b > 0.0) {
                entry.bmi = bmi;
            }
        }

        merge_percent(&mut entry.body_fat_pct, update.body_fat_pct);
        merge_percent(&mut entry.water_pct, update.water_pct);
        merge_percent(&mut entry.muscle_pct, update.muscle_pct);

        if let Some(bone) = update.bone_mass_kg.filter(|b| b.is_finite() && *b > 0.0) {
            entry.bone_mass_kg = bone;
        }
        merge_nonzero(&mut entry.bmr_kcal, update.bmr_kcal);
        merge_nonzero(&mut entry.amr_kcal, update.amr_kcal);
        merge_nonzero(&mut entry.visceral_fat, update.visceral_fat);
        merge_nonzero(&mut entry.metabolic_age, update.metabolic_age);
        merge_nonzero(&mut entry.body_type, update.body_type);

        true
    }
}

fn merge_percent(slot: &mut f64, value: Option<f64>) {
    if let Some(v) = value.filter(|v| PERCENT_RANGE.contains(v)) {
        *slot = v;
    }
}

// zero is the "unset" sentinel, so it never overwrites a known value
fn merge_nonzero<T: Copy + Default + PartialEq>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value.filter(|v| *v != T::default()) {
        *slot = v;
    }
}
