use std::time::Duration;

use uuid::Uuid;

pub fn parse_uuid(value: &str) -> Result<Uuid, String> {
    Uuid::parse_str(value).map_err(|err| format!("invalid UUID '{}': {}", value, err))
}

/// Parses durations such as `45s`, `30m`, `1h30m` or `1h2m3s`.
pub fn parse_duration_arg(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err("duration cannot be empty".into());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in trimmed.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            _ => return Err(format!("invalid duration '{}': unknown unit '{}'", input, c)),
        };
        if digits.is_empty() {
            return Err(format!("invalid duration '{}': expected number+unit", input));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{}': number too large", input))?;
        total = value
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| format!("invalid duration '{}': too large", input))?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!(
            "invalid duration '{}': missing unit (s|m|h|d)",
            input
        ));
    }
    if total == 0 {
        return Err("duration must be greater than zero".into());
    }
    Ok(Duration::from_secs(total))
}

/// Absolute `http` or `https` URL for `--notify`.
pub fn parse_notify_url(value: &str) -> Result<String, String> {
    let url = url::Url::parse(value.trim())
        .map_err(|err| format!("invalid notify URL '{}': {}", value, err))?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(url.to_string()),
        _ => Err(format!("invalid notify URL '{}': expected http(s)://host", value)),
    }
}

pub fn parse_concurrency(value: &str) -> Result<usize, String> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err("concurrency must be at least 1".into()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("invalid concurrency '{}'", value)),
    }
}
