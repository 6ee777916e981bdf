//! Helpers for duration strings used in resource requirements and time limits.
//!
//! Two notations are accepted: ISO8601 durations (`P1DT2H`, `PT30M`, `PT45S`) and the
//! batch-scheduler notation `[D-]HH:MM:SS`, `HH:MM`, or bare minutes.

/// Convert a duration string to seconds.
pub fn duration_string_to_seconds(value: &str) -> Result<u64, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration string".to_string());
    }
    if value.starts_with('P') || value.starts_with('p') {
        parse_iso8601(value)
    } else {
        parse_walltime(value)
    }
}

fn parse_iso8601(value: &str) -> Result<u64, String> {
    let upper = value.to_uppercase();
    let body = &upper[1..];
    let mut total: u64 = 0;
    let mut number = String::new();
    let mut in_time = false;
    for c in body.chars() {
        match c {
            'T' => {
                if !number.is_empty() {
                    return Err(format!("invalid ISO8601 duration: {}", value));
                }
                in_time = true;
            }
            '0'..='9' | '.' => number.push(c),
            unit => {
                let n: f64 = number
                    .parse()
                    .map_err(|_| format!("invalid ISO8601 duration: {}", value))?;
                number.clear();
                let mult = match (unit, in_time) {
                    ('W', false) => 7 * 86400,
                    ('D', false) => 86400,
                    ('H', true) => 3600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return Err(format!("invalid ISO8601 duration: {}", value)),
                };
                total += (n * mult as f64).round() as u64;
            }
        }
    }
    if !number.is_empty() {
        return Err(format!("invalid ISO8601 duration: {}", value));
    }
    Ok(total)
}

fn parse_walltime(value: &str) -> Result<u64, String> {
    let err = || format!("invalid walltime: {}", value);
    let (days, rest) = match value.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().map_err(|_| err())?, rest),
        None => (0, value),
    };
    let parts = rest
        .split(':')
        .map(|p| p.parse::<u64>().map_err(|_| err()))
        .collect::<Result<Vec<_>, _>>()?;
    let seconds = match parts.as_slice() {
        [minutes] if days == 0 => minutes * 60,
        [hours] => hours * 3600,
        [hours, minutes] if days > 0 => hours * 3600 + minutes * 60,
        [minutes, seconds] => minutes * 60 + seconds,
        [hours, minutes, seconds] => hours * 3600 + minutes * 60 + seconds,
        _ => return Err(err()),
    };
    Ok(days * 86400 + seconds)
}

/// Format seconds to ISO8601 duration (e.g., "PT2H30M")
pub fn format_duration_iso8601(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    if hours > 0 && mins > 0 {
        format!("PT{}H{}M", hours, mins)
    } else if hours > 0 {
        format!("PT{}H", hours)
    } else {
        format!("PT{}M", mins.max(1))
    }
}

/// Format seconds as `HH:MM:SS` for batch-scheduler directives.
pub fn format_walltime(secs: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}
