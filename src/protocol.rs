//! BF 915 wire protocol: GATT identifiers and command frames.
//!
//! The vendor protocol is undocumented. Commands and the measurement
//! characteristic below are the ones observed to work; responses come back as
//! notifications on the same characteristic and are handled by
//! [`crate::decoder`].

use uuid::Uuid;

use crate::config::UserProfile;

/// Vendor service hosting the measurement characteristic.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Characteristic used for both command writes and notifications.
pub const MEASUREMENT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

pub const CMD_INIT: u8 = 0xE6;
pub const CMD_USER_QUERY: u8 = 0xE7;
const USER_QUERY_SUBCOMMAND: u8 = 0x41;
const ACTIVITY_LEVEL: u8 = 0x03;

/// Init command sent once per session, before subscribing.
pub const INIT_COMMAND: [u8; 2] = [CMD_INIT, 0x01];

pub const USER_QUERY_LEN: usize = 10;

/// Per-user query: `E7 41 <id> <gender> <age> <height> 03 00 00 00`.
pub fn user_query(profile: &UserProfile) -> [u8; USER_QUERY_LEN] {
    [
        CMD_USER_QUERY,
        USER_QUERY_SUBCOMMAND,
        profile.id,
        profile.gender.wire_byte(),
        profile.age,
        profile.height_cm,
        ACTIVITY_LEVEL,
        0x00,
        0x00,
        0x00,
    ]
}

/// Space-separated hex dump used in log output.
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Gender;

    #[test]
    fn query_command_layout() {
        let profile = UserProfile::new(3, "Diogo", Gender::Male, 21, 184);
        assert_eq!(
            user_query(&profile),
            [0xE7, 0x41, 0x03, 0x01, 0x15, 0xB8, 0x03, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn query_command_for_female_user() {
        let profile = UserProfile::new(2, "Sofia", Gender::Female, 53, 167);
        assert_eq!(
            user_query(&profile),
            [0xE7, 0x41, 0x02, 0x00, 53, 167, 0x03, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn init_command_bytes() {
        assert_eq!(INIT_COMMAND, [0xE6, 0x01]);
    }

    #[test]
    fn gatt_identifiers() {
        assert_eq!(
            MEASUREMENT_CHARACTERISTIC_UUID.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            SERVICE_UUID,
            "0000ffe0-0000-1000-8000-00805f9b34fb".parse::<Uuid>().unwrap()
        );
    }

    #[test]
    fn hex_dump_format() {
        assert_eq!(hex_dump(&[0x00, 0xE7, 0x2C]), "00 e7 2c");
        assert_eq!(hex_dump(&[]), "");
    }
}
