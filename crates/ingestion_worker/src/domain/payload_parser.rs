use common::domain::ParsedPayload;
use serde_json::{Map, Number, Value};

/// Result of decoding a raw payload, tagged with the stage that accepted it
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Self-describing document: a mapping, or a sequence wrapped as `values`
    Structured(ParsedPayload),
    /// `key=value` tokens separated by commas, semicolons or whitespace
    KeyValue(ParsedPayload),
    /// Comma separated numbers
    NumericList(Vec<Value>),
    /// Nothing else matched; the decoded text is kept verbatim
    Raw(String),
}

impl ParseOutcome {
    pub fn stage(&self) -> &'static str {
        match self {
            ParseOutcome::Structured(_) => "structured",
            ParseOutcome::KeyValue(_) => "key_value",
            ParseOutcome::NumericList(_) => "numeric_list",
            ParseOutcome::Raw(_) => "raw",
        }
    }

    pub fn into_payload(self) -> ParsedPayload {
        match self {
            ParseOutcome::Structured(payload) | ParseOutcome::KeyValue(payload) => payload,
            ParseOutcome::NumericList(values) => ParsedPayload::values(values),
            ParseOutcome::Raw(text) => ParsedPayload::raw(text),
        }
    }
}

type Stage = fn(&str) -> Option<ParseOutcome>;

/// Tried in order; the first stage returning `Some` wins and results are never merged.
const STAGES: [Stage; 3] = [parse_structured, parse_key_values, parse_numeric_list];

/// Decode raw bytes into a canonical, non-empty field mapping.
///
/// Never fails: anything unrecognised ends up as `{"raw": <text>}`.
pub fn parse(raw: &[u8]) -> ParsedPayload {
    classify(raw).into_payload()
}

/// Like [`parse`] but keeps track of which stage accepted the input
pub fn classify(raw: &[u8]) -> ParseOutcome {
    let text = decode_text(raw);
    STAGES
        .iter()
        .find_map(|stage| stage(&text))
        .unwrap_or(ParseOutcome::Raw(text))
}

/// Best-effort UTF-8 decoding: invalid sequences and NUL characters are dropped.
fn decode_text(raw: &[u8]) -> String {
    let mut text = String::with_capacity(raw.len());
    for chunk in raw.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    // jsonb cannot store NUL
    text.retain(|c| c != '\0');
    text.trim().to_string()
}

fn parse_structured(text: &str) -> Option<ParseOutcome> {
    match serde_json::from_str::<Value>(text).ok()? {
        Value::Object(fields) => ParsedPayload::from_map(fields).map(ParseOutcome::Structured),
        Value::Array(values) => Some(ParseOutcome::Structured(ParsedPayload::values(values))),
        _ => None,
    }
}

fn parse_key_values(text: &str) -> Option<ParseOutcome> {
    let mut fields = Map::new();

    let tokens = text
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty());

    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = parse_number(value).unwrap_or_else(|| Value::String(value.to_string()));
        fields.insert(key, value);
    }

    ParsedPayload::from_map(fields).map(ParseOutcome::KeyValue)
}

fn parse_numeric_list(text: &str) -> Option<ParseOutcome> {
    if !text.contains(',') {
        return None;
    }

    text.split(',')
        .map(|segment| parse_number(segment.trim()))
        .collect::<Option<Vec<_>>>()
        .map(ParseOutcome::NumericList)
}

/// Float if the literal has a decimal point, integer otherwise.
fn parse_number(text: &str) -> Option<Value> {
    if !is_numeric_literal(text) {
        return None;
    }
    if text.contains('.') {
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
    } else {
        // Integers wider than 64 bits stay text
        text.parse::<i64>().ok().map(Value::from)
    }
}

/// Optional leading `-`, ASCII digits, at most one `.`, at least one digit
fn is_numeric_literal(text: &str) -> bool {
    let unsigned = text.strip_prefix('-').unwrap_or(text);
    let mut seen_dot = false;
    let mut seen_digit = false;

    for c in unsigned.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }

    seen_digit
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(payload: ParsedPayload) -> Value {
        Value::Object(payload.into_fields())
    }

    #[test]
    fn test_structured_mapping_round_trips() {
        let payload = parse(br#"{"a":1,"b":"x"}"#);
        assert_eq!(fields(payload), json!({"a": 1, "b": "x"}));
    }

    #[test]
    fn test_structured_mapping_keeps_nested_values() {
        let payload = parse(br#"{"device_id":"X1","gps":{"lat":1.5,"lon":-2.0},"tags":["a"]}"#);
        assert_eq!(
            fields(payload),
            json!({"device_id": "X1", "gps": {"lat": 1.5, "lon": -2.0}, "tags": ["a"]})
        );
    }

    #[test]
    fn test_structured_sequence_is_wrapped() {
        let outcome = classify(br#"[1, "two", 3.5]"#);
        assert_eq!(outcome.stage(), "structured");
        assert_eq!(fields(outcome.into_payload()), json!({"values": [1, "two", 3.5]}));
    }

    #[test]
    fn test_empty_structured_mapping_falls_through_to_raw() {
        let payload = parse(b"{}");
        assert_eq!(fields(payload), json!({"raw": "{}"}));
    }

    #[test]
    fn test_structured_scalar_is_not_accepted() {
        let payload = parse(b"42");
        assert_eq!(fields(payload), json!({"raw": "42"}));
    }

    #[test]
    fn test_key_values_with_whitespace() {
        let outcome = classify(b"rssi=-65 temperature=24.1");
        assert_eq!(outcome.stage(), "key_value");

        let payload = outcome.into_payload();
        assert_eq!(payload.get("rssi"), Some(&json!(-65)));
        assert!(payload.get("rssi").unwrap().is_i64());
        assert_eq!(payload.get("temperature"), Some(&json!(24.1)));
        assert!(payload.get("temperature").unwrap().is_f64());
        assert_eq!(payload.len(), 2);
    }

    #[test]
    fn test_key_values_with_mixed_separators() {
        let payload = parse(b"Temp=21.5;HUMIDITY=40, status=ok node = n1");
        assert_eq!(
            fields(payload),
            json!({"temp": 21.5, "humidity": 40, "status": "ok"})
        );
    }

    #[test]
    fn test_key_values_keep_text_and_later_duplicates_win() {
        let payload = parse(b"mode=eco,mode=boost,fw=1.2.3,empty=");
        assert_eq!(
            fields(payload),
            json!({"mode": "boost", "fw": "1.2.3", "empty": ""})
        );
    }

    #[test]
    fn test_key_values_split_on_first_separator_only() {
        let payload = parse(b"query=a=b");
        assert_eq!(fields(payload), json!({"query": "a=b"}));
    }

    #[test]
    fn test_tokens_without_key_are_ignored() {
        let payload = parse(b"=5,=6");
        assert_eq!(fields(payload), json!({"raw": "=5,=6"}));
    }

    #[test]
    fn test_numeric_list() {
        let outcome = classify(b"1,2,3");
        assert_eq!(outcome.stage(), "numeric_list");
        assert_eq!(fields(outcome.into_payload()), json!({"values": [1, 2, 3]}));
    }

    #[test]
    fn test_numeric_list_mixes_floats_and_integers() {
        let payload = parse(b" 24.1, 50 ,-65 ");
        assert_eq!(fields(payload), json!({"values": [24.1, 50, -65]}));
    }

    #[test]
    fn test_numeric_list_with_empty_segment_is_raw() {
        let payload = parse(b"1,,3");
        assert_eq!(fields(payload), json!({"raw": "1,,3"}));
    }

    #[test]
    fn test_numeric_list_with_text_segment_is_raw() {
        let payload = parse(b"1,two,3");
        assert_eq!(fields(payload), json!({"raw": "1,two,3"}));
    }

    #[test]
    fn test_garbled_input_falls_back_to_raw() {
        let outcome = classify(b"###garbled###");
        assert_eq!(outcome.stage(), "raw");
        assert_eq!(fields(outcome.into_payload()), json!({"raw": "###garbled###"}));
    }

    #[test]
    fn test_empty_input_is_empty_raw() {
        assert_eq!(fields(parse(b"")), json!({"raw": ""}));
        assert_eq!(fields(parse(b"   \n")), json!({"raw": ""}));
    }

    #[test]
    fn test_invalid_utf8_is_dropped_not_fatal() {
        let payload = parse(b"rssi=-60 \xff\xfetemp=20.5");
        assert_eq!(fields(payload), json!({"rssi": -60, "temp": 20.5}));
    }

    #[test]
    fn test_nul_bytes_are_removed() {
        let payload = parse(b"hello\0world");
        assert_eq!(fields(payload), json!({"raw": "helloworld"}));
    }

    #[test]
    fn test_oversized_integer_stays_text() {
        let payload = parse(b"counter=123456789012345678901234567890");
        assert_eq!(
            fields(payload),
            json!({"counter": "123456789012345678901234567890"})
        );
    }

    #[test]
    fn test_numeric_literal_rules() {
        assert!(is_numeric_literal("-65"));
        assert!(is_numeric_literal("24.1"));
        assert!(is_numeric_literal(".5"));
        assert!(is_numeric_literal("-3."));
        assert!(!is_numeric_literal("-"));
        assert!(!is_numeric_literal("."));
        assert!(!is_numeric_literal("1.2.3"));
        assert!(!is_numeric_literal("1e5"));
        assert!(!is_numeric_literal("--1"));
        assert!(!is_numeric_literal(""));
    }

    #[test]
    fn test_parse_is_total_over_arbitrary_bytes() {
        // Deterministic xorshift so failures are reproducible
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        for len in 0..512usize {
            let bytes: Vec<u8> = (0..len % 64)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    (state & 0xff) as u8
                })
                .collect();

            let payload = parse(&bytes);
            assert!(!payload.is_empty(), "empty payload for {:?}", bytes);
        }
    }
}
