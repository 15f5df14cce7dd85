use rust_decimal::{Decimal, RoundingStrategy};

/// Format a decimal as Brazilian reais with thousands separators: R$ 1.234,56
pub fn money(val: Decimal) -> String {
    let negative = val.is_sign_negative() && !val.is_zero();
    let cents = format!("{:.2}", val.abs().round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero));
    let (int_part, dec_part) = cents.split_once('.').unwrap_or((cents.as_str(), "00"));

    let mut with_dots = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            with_dots.push('.');
        }
        with_dots.push(c);
    }
    let with_dots: String = with_dots.chars().rev().collect();

    if negative {
        format!("-R$ {with_dots},{dec_part}")
    } else {
        format!("R$ {with_dots},{dec_part}")
    }
}

/// 11-digit cpf as 123.456.789-00; anything else is shown as stored.
pub fn cpf(val: &str) -> String {
    if val.len() != 11 || !val.bytes().all(|b| b.is_ascii_digit()) {
        return val.to_string();
    }
    format!("{}.{}.{}-{}", &val[..3], &val[3..6], &val[6..9], &val[9..])
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(Decimal::new(123456, 2)), "R$ 1.234,56");
        assert_eq!(money(Decimal::new(-50000, 2)), "-R$ 500,00");
        assert_eq!(money(Decimal::ZERO), "R$ 0,00");
        assert_eq!(money(Decimal::new(100000099, 2)), "R$ 1.000.000,99");
        assert_eq!(money(Decimal::new(421, 1)), "R$ 42,10");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_cpf_formatting() {
        assert_eq!(cpf("12345678900"), "123.456.789-00");
        assert_eq!(cpf("123"), "123");
    }
}
