//! Heuristic extractors for Japanese corporate text.
//!
//! Used to mine search snippets and fetched pages when a model response
//! leaves a field empty.

use std::sync::LazyLock;

use regex::Regex;

/// The 47 prefectures, in JIS order.
pub const PREFECTURES: [&str; 47] = [
    "北海道", "青森県", "岩手県", "宮城県", "秋田県", "山形県", "福島県", "茨城県", "栃木県",
    "群馬県", "埼玉県", "千葉県", "東京都", "神奈川県", "新潟県", "富山県", "石川県", "福井県",
    "山梨県", "長野県", "岐阜県", "静岡県", "愛知県", "三重県", "滋賀県", "京都府", "大阪府",
    "兵庫県", "奈良県", "和歌山県", "鳥取県", "島根県", "岡山県", "広島県", "山口県", "徳島県",
    "香川県", "愛媛県", "高知県", "福岡県", "佐賀県", "長崎県", "熊本県", "大分県", "宮崎県",
    "鹿児島県", "沖縄県",
];

const ENGLISH_PREFECTURES: &[(&str, &str)] = &[
    ("Tokyo", "東京都"),
    ("Osaka", "大阪府"),
    ("Kyoto", "京都府"),
    ("Hokkaido", "北海道"),
    ("Aichi", "愛知県"),
    ("Kanagawa", "神奈川県"),
    ("Saitama", "埼玉県"),
    ("Chiba", "千葉県"),
    ("Hyogo", "兵庫県"),
    ("Fukuoka", "福岡県"),
];

/// Longest address kept, in characters.
const MAX_ADDRESS_CHARS: usize = 120;

/// Default cap on bullet list length.
pub const MAX_BULLETS: usize = 7;

static POSTAL_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"〒\s*\d{3}-?\d{4}").expect("valid postal regex"));

static EMPLOYEE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"従業員数\s*[:：]?\s*(?:約|連結)?\s*([\d,，]+)\s*(?:名|人)?",
        r"(?i)employees?\s*[:：]?\s*([\d,，]+)",
        r"社員数\s*[:：]?\s*(?:約)?\s*([\d,，]+)",
        r"スタッフ数\s*[:：]?\s*([\d,，]+)",
        r"従業者数\s*[:：]?\s*([\d,，]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid employee regex"))
    .collect()
});

static LEGAL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    let forms = "株式会社|有限会社|合同会社|合資会社|合名会社|一般社団法人|一般財団法人|公益社団法人|公益財団法人|NPO法人|特定非営利活動法人";
    Regex::new(&format!(
        r"(?:(?:{forms})[^\s、。,（(「」|｜：:/]+)|(?:[^\s、。,（(「」|｜：:/]+(?:{forms}))"
    ))
    .expect("valid legal name regex")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{3000}]+").expect("valid whitespace regex"));

/// Find the prefecture mentioned earliest in `text`.
///
/// Falls back to English names of the major prefectures.
pub fn extract_prefecture(text: &str) -> Option<&'static str> {
    let earliest = PREFECTURES
        .iter()
        .filter_map(|p| text.find(p).map(|pos| (pos, *p)))
        .min_by_key(|(pos, _)| *pos);
    if let Some((_, prefecture)) = earliest {
        return Some(prefecture);
    }

    ENGLISH_PREFECTURES
        .iter()
        .filter_map(|(en, jp)| text.find(en).map(|pos| (pos, *jp)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, jp)| jp)
}

/// Extract a headquarters address line.
///
/// The address starts at a postal code mark or, failing that, at the first
/// prefecture on the line, and runs to the end of the sentence.
pub fn extract_address(text: &str) -> Option<String> {
    for line in text.lines() {
        let Some(prefecture) = PREFECTURES.iter().find(|p| line.contains(*p)) else {
            continue;
        };

        let start = POSTAL_CODE
            .find(line)
            .map(|m| m.start())
            .or_else(|| line.find(prefecture))?;

        let tail = &line[start..];
        let end = tail.find('。').unwrap_or(tail.len());
        let address = truncate_chars(tail[..end].trim(), MAX_ADDRESS_CHARS);

        if address.chars().count() >= 6 {
            return Some(address);
        }
    }
    None
}

/// Extract the employee count. Several mentions (consolidated vs. single
/// entity) resolve to the largest.
pub fn extract_employee_count(text: &str) -> Option<u64> {
    EMPLOYEE_PATTERNS
        .iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|caps| {
            let digits: String = caps
                .get(1)?
                .as_str()
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            digits.parse::<u64>().ok()
        })
        .filter(|n| *n > 0)
        .max()
}

/// Extract the registered company name (e.g. `株式会社サンプル`).
pub fn extract_legal_name(text: &str) -> Option<String> {
    LEGAL_NAME
        .find(text)
        .map(|m| m.as_str().trim().to_string())
}

/// Render items as a `・`-prefixed list, one per line.
///
/// Items are sanitized, blanks and duplicates dropped, and the list capped at
/// `max` entries. Returns `None` when nothing remains.
pub fn bullet_list<I, S>(items: I, max: usize) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: Vec<String> = Vec::new();
    for item in items {
        let clean = sanitize_text(item.as_ref().trim_start_matches(['・', '-', '*', '•']));
        if clean.is_empty() || seen.contains(&clean) {
            continue;
        }
        seen.push(clean);
        if seen.len() >= max {
            break;
        }
    }

    if seen.is_empty() {
        None
    } else {
        Some(
            seen.iter()
                .map(|s| format!("・{s}"))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Collapse runs of spaces, strip control characters, and trim.
pub fn sanitize_text(text: &str) -> String {
    let without_controls: String = text
        .chars()
        .map(|c| if matches!(c, '\n' | '\r' | '\t') { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect();
    WHITESPACE
        .replace_all(&without_controls, " ")
        .trim()
        .to_string()
}

/// Keep the first `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
