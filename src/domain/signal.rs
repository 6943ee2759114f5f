//! Signal-strength classification and the 5-segment signal meter.
//!
//! Pure numeric transforms with no state; everything here is driven by the
//! RSSI readings the adapter reports.

/// Platform sentinel meaning "RSSI unknown/unavailable".
pub const RSSI_UNAVAILABLE: i16 = 127;

/// Default reject threshold in dBm. Candidates weaker than this are not
/// worth connecting to. Tunable via settings; an earlier firmware pairing
/// used -85 but that rejected workable signals at the far end of a garage.
pub const DEFAULT_REJECT_THRESHOLD: i16 = -95;

/// Verdict on a received-signal-strength reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Reject,
    Accept,
}

/// Classify an RSSI reading against the reject threshold.
///
/// The 127 sentinel is always rejected, as is anything strictly below
/// `reject_threshold`.
pub fn classify(rssi: i16, reject_threshold: i16) -> Signal {
    if rssi == RSSI_UNAVAILABLE || rssi < reject_threshold {
        Signal::Reject
    } else {
        Signal::Accept
    }
}

/// Map an RSSI reading to a 0-100 quality percentage.
///
/// Linear over [-100, -50] dBm; anything at or above -50 is full quality.
pub fn quality_percent(rssi: i16) -> u8 {
    let quality = 2 * (i32::from(rssi) + 100);
    quality.clamp(0, 100) as u8
}

/// Number of filled segments in the 5-segment signal meter, `ceil(q / 20)`.
pub fn bar_count(quality: u8) -> u8 {
    (quality.min(100) + 19) / 20
}

/// Render the signal meter as the classic filled/empty square string.
pub fn connection_bar(bars: u8) -> String {
    let mut result = String::with_capacity(5 * 3);
    for i in 0..5 {
        result.push(if i < bars { '\u{25A0}' } else { '\u{25A1}' });
    }
    result
}
