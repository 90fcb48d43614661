//! SAE J1939 identifier layout and diagnostic messages
//!
//! 29-bit J1939 identifiers are `priority(3) | EDP(1) | DP(1) | PF(8) | PS(8) | SA(8)`.
//! When PF < 240 (PDU1) the PS byte is a destination address and not part of the
//! PGN.
//!
//! DM1/DM2 payloads start with two lamp status bytes followed by 4-byte DTCs:
//! `SPN low | SPN mid | SPN high(3) FMI(5) | CM(1) OC(7)`.

use crate::types::Severity;

/// Active diagnostic trouble codes
pub const PGN_DM1: u32 = 0xFECA;
/// Previously active diagnostic trouble codes
pub const PGN_DM2: u32 = 0xFECB;

/// A 29-bit identifier split into its J1939 fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct J1939Id {
    pub priority: u8,
    pub pgn: u32,
    pub source_address: u8,
    /// Destination for PDU1 (peer-to-peer) messages
    pub destination: Option<u8>,
}

impl J1939Id {
    pub fn from_can_id(id: u32) -> Self {
        let id = id & 0x1FFF_FFFF;
        let pf = ((id >> 16) & 0xFF) as u8;
        let ps = ((id >> 8) & 0xFF) as u8;
        let dp_pf = (id >> 16) & 0x3FF;
        let (pgn, destination) = if pf < 240 {
            (dp_pf << 8, Some(ps))
        } else {
            ((dp_pf << 8) | ps as u32, None)
        };
        Self {
            priority: ((id >> 26) & 0x7) as u8,
            pgn,
            source_address: (id & 0xFF) as u8,
            destination,
        }
    }

    /// Parameter group family: data page + PDU format
    ///
    /// DM1 and DM2 share a family, as do the proprietary PGNs of one page.
    pub fn family(&self) -> u32 {
        self.pgn >> 8
    }
}

/// A diagnostic trouble code from a DM1/DM2 payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtc {
    /// Suspect parameter number (19 bits)
    pub spn: u32,
    /// Failure mode identifier (5 bits)
    pub fmi: u8,
    /// Occurrence count (7 bits)
    pub occurrence_count: u8,
}

/// Parse the DTC list of a DM1/DM2 payload
///
/// An all-zero DTC means "no active faults" and padding is `FF`; both are skipped.
pub fn parse_dtcs(data: &[u8]) -> Vec<Dtc> {
    data.get(2..)
        .unwrap_or(&[])
        .chunks_exact(4)
        .filter(|raw| raw.iter().any(|&b| b != 0xFF))
        .map(|raw| Dtc {
            spn: raw[0] as u32 | (raw[1] as u32) << 8 | ((raw[2] & 0xE0) as u32) << 11,
            fmi: raw[2] & 0x1F,
            occurrence_count: raw[3] & 0x7F,
        })
        .filter(|dtc| dtc.spn != 0)
        .collect()
}

fn lamp_on(lamps: u8, shift: u8) -> bool {
    (lamps >> shift) & 0x03 == 0x01
}

/// Severity carried by the DM1 lamp status byte
pub fn lamp_severity(lamps: u8) -> Severity {
    if lamp_on(lamps, 4) {
        // red stop lamp
        Severity::Critical
    } else if lamp_on(lamps, 6) || lamp_on(lamps, 2) {
        // malfunction indicator or amber warning
        Severity::High
    } else if lamp_on(lamps, 0) {
        // protect lamp
        Severity::Medium
    } else {
        Severity::High
    }
}

/// Names of frequently reported SPNs
pub fn spn_name(spn: u32) -> Option<&'static str> {
    Some(match spn {
        91 => "Accelerator Pedal Position",
        94 => "Fuel Delivery Pressure",
        100 => "Engine Oil Pressure",
        102 => "Intake Manifold Pressure",
        105 => "Intake Manifold Temperature",
        110 => "Engine Coolant Temperature",
        158 => "Keyswitch Battery Potential",
        168 => "Battery Potential",
        190 => "Engine Speed",
        520 => "Retarder Selection",
        629 => "Controller #1",
        639 => "J1939 Network #1",
        1569 => "Engine Protection Torque Derate",
        _ => return None,
    })
}

pub fn fmi_description(fmi: u8) -> &'static str {
    match fmi {
        0 => "data valid but above normal range (most severe)",
        1 => "data valid but below normal range (most severe)",
        2 => "data erratic, intermittent or incorrect",
        3 => "voltage above normal or shorted high",
        4 => "voltage below normal or shorted low",
        5 => "current below normal or open circuit",
        6 => "current above normal or grounded circuit",
        7 => "mechanical system not responding",
        8 => "abnormal frequency, pulse width or period",
        9 => "abnormal update rate",
        10 => "abnormal rate of change",
        11 => "root cause not known",
        12 => "bad intelligent device or component",
        13 => "out of calibration",
        14 => "special instructions",
        15..=17 => "data valid but above/below normal range",
        18 => "data valid but below normal range (moderately severe)",
        19 => "received network data in error",
        31 => "condition exists",
        _ => "reserved",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu2_identifier() {
        let id = J1939Id::from_can_id(0x18FECA00);
        assert_eq!(id.priority, 6);
        assert_eq!(id.pgn, PGN_DM1);
        assert_eq!(id.source_address, 0x00);
        assert_eq!(id.destination, None);
        assert_eq!(id.family(), 0xFE);
    }

    #[test]
    fn test_pdu1_identifier_drops_destination() {
        // TP.CM to 0x25 from 0xF9
        let id = J1939Id::from_can_id(0x1CEC25F9);
        assert_eq!(id.pgn, 0xEC00);
        assert_eq!(id.destination, Some(0x25));
        assert_eq!(id.source_address, 0xF9);
    }

    #[test]
    fn test_parse_dtcs() {
        // lamps, SPN 110 FMI 3 OC 1, padding
        let data = [0x04, 0xFF, 0x6E, 0x00, 0x03, 0x01, 0xFF, 0xFF];
        let dtcs = parse_dtcs(&data);
        assert_eq!(dtcs, vec![Dtc { spn: 110, fmi: 3, occurrence_count: 1 }]);

        // high SPN bits come from the top of byte 4
        let data = [0x00, 0x00, 0x01, 0x02, 0x23, 0x05];
        assert_eq!(parse_dtcs(&data)[0].spn, 0x10201);
        assert_eq!(parse_dtcs(&data)[0].fmi, 3);

        // "no DTC" marker
        assert!(parse_dtcs(&[0x00, 0xFF, 0, 0, 0, 0, 0xFF, 0xFF]).is_empty());
    }

    #[test]
    fn test_lamp_severity() {
        assert_eq!(lamp_severity(0b0001_0000), Severity::Critical);
        assert_eq!(lamp_severity(0b0100_0000), Severity::High);
        assert_eq!(lamp_severity(0b0000_0100), Severity::High);
        assert_eq!(lamp_severity(0b0000_0001), Severity::Medium);
        assert_eq!(lamp_severity(0), Severity::High);
    }

    #[test]
    fn test_spn_names() {
        assert_eq!(spn_name(110), Some("Engine Coolant Temperature"));
        assert_eq!(spn_name(12345), None);
        assert_eq!(fmi_description(3), "voltage above normal or shorted high");
    }
}
