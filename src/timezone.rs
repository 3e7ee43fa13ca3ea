use crate::countries::COUNTRY_ZONES;
use chrono::{NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use log::warn;

/// Codes missing from the zone table.
const MANUAL_ZONES: &[(&str, &str)] = &[("XK", "CET")];

/// Default zone of a country: the zone whose current UTC offset is shared by
/// the most zones of that country, first occurrence winning ties. Unknown
/// codes fall back to the manual table, then to UTC.
pub fn country_timezone(country_code: &str) -> Tz {
    let code = country_code.trim().to_ascii_uppercase();
    let zones = match COUNTRY_ZONES.binary_search_by(|(c, _)| (*c).cmp(code.as_str())) {
        Ok(i) => COUNTRY_ZONES[i].1,
        Err(_) => {
            if let Some((_, name)) = MANUAL_ZONES.iter().find(|(c, _)| *c == code) {
                if let Ok(tz) = name.parse::<Tz>() {
                    return tz;
                }
            }
            warn!("timezone not found for {}, return UTC", country_code);
            return Tz::UTC;
        }
    };

    let now = Utc::now().naive_utc();
    let candidates: Vec<(Tz, i32)> = zones
        .iter()
        .filter_map(|name| match name.parse::<Tz>() {
            Ok(tz) => Some((tz, offset_seconds(&tz, now))),
            Err(_) => {
                warn!("unknown zone {} listed for {}", name, code);
                None
            }
        })
        .collect();

    // counts in first-seen order of each offset
    let mut counts: Vec<(i32, usize)> = Vec::new();
    for (_, offset) in &candidates {
        match counts.iter_mut().find(|(o, _)| o == offset) {
            Some((_, n)) => *n += 1,
            None => counts.push((*offset, 1)),
        }
    }
    let mut best: Option<(i32, usize)> = None;
    for (offset, n) in counts {
        if best.map_or(true, |(_, max)| n > max) {
            best = Some((offset, n));
        }
    }

    match best {
        Some((offset, _)) => candidates
            .into_iter()
            .find(|(_, o)| *o == offset)
            .map(|(tz, _)| tz)
            .unwrap_or(Tz::UTC),
        None => {
            warn!("no usable zone for {}, returning UTC", code);
            Tz::UTC
        }
    }
}

fn offset_seconds(tz: &Tz, at_utc: NaiveDateTime) -> i32 {
    tz.offset_from_utc_datetime(&at_utc).fix().local_minus_utc()
}

/// Current UTC offset of `tz` in `+08:00` form.
pub fn offset_string(tz: &Tz) -> String {
    format_offset(offset_seconds(tz, Utc::now().naive_utc()))
}

pub fn country_offset_string(country_code: &str) -> String {
    offset_string(&country_timezone(country_code))
}

fn format_offset(seconds: i32) -> String {
    let sign = if seconds < 0 { '-' } else { '+' };
    let abs = seconds.abs();
    format!("{}{:02}:{:02}", sign, abs / 3600, (abs % 3600) / 60)
}

/// Interprets `local` as wall-clock time in `tz` and returns it in UTC.
/// Times skipped by a DST jump use the zone's current offset.
pub fn localize_to_utc(local: NaiveDateTime, tz: &Tz) -> NaiveDateTime {
    match tz.from_local_datetime(&local).earliest() {
        Some(dt) => dt.naive_utc(),
        None => {
            let offset = offset_seconds(tz, Utc::now().naive_utc());
            local - chrono::Duration::seconds(offset as i64)
        }
    }
}
