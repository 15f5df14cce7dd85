//! Text folding shared by the column normalizer, the sanitizer, the validator
//! and the fixed-width writers.

/// Map an accented Latin letter to its unaccented ASCII base.
/// Anything outside Latin-1 Supplement / Latin Extended-A passes through.
fn fold_letter(c: char) -> Option<char> {
    let base = match c {
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => 'A',
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' | 'ª' => 'a',
        'Ç' | 'Ć' | 'Č' => 'C',
        'ç' | 'ć' | 'č' => 'c',
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ę' | 'Ě' => 'E',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => 'e',
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' => 'I',
        'ì' | 'í' | 'î' | 'ï' | 'ī' => 'i',
        'Ñ' | 'Ń' | 'Ň' => 'N',
        'ñ' | 'ń' | 'ň' => 'n',
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' => 'O',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'º' => 'o',
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' => 'U',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' => 'u',
        'Ý' | 'Ÿ' => 'Y',
        'ý' | 'ÿ' => 'y',
        'Š' => 'S',
        'š' => 's',
        'Ž' => 'Z',
        'ž' => 'z',
        _ => return None,
    };
    Some(base)
}

/// Closest ASCII rendering of typographic punctuation. `Some("")` means drop.
fn fold_punctuation(c: char) -> Option<&'static str> {
    let ascii = match c {
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' | '´' | '`' => "'",
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '«' | '»' => "\"",
        '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2212}' => "-",
        '\u{2026}' => "...",
        '\u{00A0}' | '\u{2007}' | '\u{202F}' | '\u{2009}' => " ",
        '\u{2022}' | '·' => "-",
        '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}' => "",
        _ => return None,
    };
    Some(ascii)
}

/// Remove accents, keeping everything else.
pub fn fold_accents(s: &str) -> String {
    s.chars().map(|c| fold_letter(c).unwrap_or(c)).collect()
}

/// Lookup key for headers and keywords: accent-folded, lowercase, any run of
/// non-alphanumerics collapsed to one space, trimmed.
pub fn normalize_key(s: &str) -> String {
    let folded = fold_accents(s).to_lowercase();
    let mut out = String::with_capacity(folded.len());
    let mut pending_space = false;
    for c in folded.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            pending_space = true;
        }
    }
    out
}

/// Comparison form of a person's name: accents folded, upper case,
/// inner whitespace collapsed.
pub fn normalize_name(s: &str) -> String {
    fold_accents(s)
        .to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Digits only, left-padded with zeros to 11. Empty stays empty; more than
/// 11 digits are kept as-is so the validator can reject them.
pub fn normalize_cpf(raw: &str) -> String {
    let trimmed = raw.trim();
    if matches!(trimmed.to_lowercase().as_str(), "nan" | "none" | "null") {
        return String::new();
    }
    let digits = digits_only(trimmed);
    if digits.is_empty() {
        return digits;
    }
    format!("{digits:0>11}")
}

/// Spreadsheet tools turn long numbers into floats ("12345678900.0").
/// Strip that artificial fraction before keeping digits.
pub fn normalize_card(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    digits_only(trimmed)
}

/// Drop control characters and replace non-ASCII punctuation with its ASCII
/// counterpart. Letters, accented or not, are kept.
pub fn clean_cell(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_control() {
            continue;
        }
        if c.is_ascii() {
            out.push(c);
        } else if let Some(ascii) = fold_punctuation(c) {
            out.push_str(ascii);
        } else if c.is_alphanumeric() {
            out.push(c);
        }
        // any other non-ASCII symbol is dropped
    }
    out.trim().to_string()
}

/// Upper-case printable ASCII for positional bank files.
pub fn to_bank_ascii(s: &str) -> String {
    let cleaned = clean_cell(s);
    fold_accents(&cleaned)
        .to_uppercase()
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { ' ' })
        .collect()
}
