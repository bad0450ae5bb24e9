use std::time::Duration;

pub(crate) fn format_duration_single(d: Duration) -> String {
    // Single rounded component in one of: us, ms, s.
    let total_ns: u128 = (d.as_secs() as u128) * 1_000_000_000u128 + (d.subsec_nanos() as u128);

    const NS_PER_US: u128 = 1_000;
    const NS_PER_MS: u128 = 1_000_000;
    const NS_PER_S: u128 = 1_000_000_000;

    fn round_div(value: u128, unit: u128) -> u128 {
        // Ties round up.
        (value + (unit / 2)) / unit
    }

    if total_ns >= NS_PER_S {
        return format!("{}s", round_div(total_ns, NS_PER_S));
    }
    if total_ns >= NS_PER_MS {
        return format!("{}ms", round_div(total_ns, NS_PER_MS));
    }

    format!("{}us", round_div(total_ns, NS_PER_US))
}

/// Trend values are milliseconds; keep two decimals below a second.
pub(crate) fn format_ms_opt(ms: Option<f64>) -> String {
    match ms {
        Some(ms) if ms.is_finite() && ms >= 1000.0 => format!("{:.2}s", ms / 1000.0),
        Some(ms) if ms.is_finite() && ms >= 1.0 => format!("{ms:.2}ms"),
        Some(ms) if ms.is_finite() => format!("{:.0}us", ms * 1000.0),
        Some(_) | None => "-".to_string(),
    }
}
