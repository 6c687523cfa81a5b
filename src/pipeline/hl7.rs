//! HL7 v2 message parsing
//!
//! Turns a frame payload into a [`ClinicalEvent`]. Only the handful of
//! fields the pipeline needs are extracted:
//!
//! | Field  | Meaning                  |
//! |--------|--------------------------|
//! | MSH-7  | message timestamp        |
//! | MSH-9  | message type (`ADT^A01`) |
//! | PID-3  | MRN                      |
//! | PID-7  | date of birth            |
//! | PID-8  | sex                      |
//! | OBR-7  | test timestamp           |
//! | OBX-3  | test code                |
//! | OBX-5  | numeric result           |

use super::errors::ParseError;
use super::types::{AdmissionEvent, ClinicalEvent, LabResultEvent, Mrn, Sex};
use chrono::{NaiveDate, NaiveDateTime};

pub const CREATININE_CODE: &str = "CREATININE";

/// Results outside this range are clamped
pub const MIN_RESULT: f64 = 0.0;
pub const MAX_RESULT: f64 = 500.0;

const FIELD_SEP: char = '|';

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub name: String,
    /// Index 0 is the segment name; for MSH index 1 is the encoding characters
    pub fields: Vec<String>,
}

impl Segment {
    /// HL7 field number `n` (1-based, as written in the standard)
    pub fn field(&self, n: usize) -> Option<&str> {
        // MSH-1 is the field separator itself, so MSH fields sit one slot lower
        let idx = if self.name == "MSH" { n.checked_sub(1)? } else { n };
        self.fields
            .get(idx)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub segments: Vec<Segment>,
}

impl Message {
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.segment("MSH").and_then(|s| s.field(9))
    }
}

/// Split payload text into segments and fields
pub fn parse_segments(input: &str) -> Result<Message, ParseError> {
    let mut segments = Vec::new();

    for line in input.split(['\r', '\n']) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<String> = line.split(FIELD_SEP).map(|f| f.to_string()).collect();
        let name = fields[0].clone();
        if name.len() != 3
            || !name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(ParseError::Malformed(format!("invalid segment name: {}", name)));
        }

        segments.push(Segment { name, fields });
    }

    match segments.first() {
        Some(first) if first.name == "MSH" => Ok(Message { segments }),
        Some(first) => Err(ParseError::Malformed(format!(
            "message must start with MSH, found {}",
            first.name
        ))),
        None => Err(ParseError::Malformed("empty message".to_string())),
    }
}

/// Match MSH-9 on its message code and, if given, trigger event.
///
/// The message structure component (`ADT^A01^ADT_A01`) is ignored.
pub fn is_message_type(message_type: &str, code: &str, trigger: Option<&str>) -> bool {
    let mut components = message_type.split('^').map(str::trim);
    if components.next() != Some(code) {
        return false;
    }
    match trigger {
        Some(trigger) => components.next() == Some(trigger),
        None => true,
    }
}

/// Parse a frame payload into a clinical event
pub fn parse(payload: &[u8]) -> Result<ClinicalEvent, ParseError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| ParseError::Malformed(format!("payload is not UTF-8: {}", e)))?;
    let message = parse_segments(text)?;

    let message_type = message
        .message_type()
        .ok_or(ParseError::MissingField("MSH-9"))?
        .to_string();

    if is_message_type(&message_type, "ADT", Some("A01")) {
        parse_admission(&message).map(ClinicalEvent::Admission)
    } else if is_message_type(&message_type, "ORU", None) {
        parse_lab_result(&message)
    } else {
        Ok(ClinicalEvent::DischargeOrUnhandled { message_type })
    }
}

fn parse_mrn(message: &Message) -> Result<Mrn, ParseError> {
    let raw = message
        .segment("PID")
        .and_then(|pid| pid.field(3))
        .ok_or(ParseError::MissingField("PID-3"))?;
    raw.parse::<Mrn>().map_err(|_| ParseError::InvalidValue {
        field: "PID-3",
        value: raw.to_string(),
    })
}

fn parse_admission(message: &Message) -> Result<AdmissionEvent, ParseError> {
    let mrn = parse_mrn(message)?;
    let pid = message.segment("PID").ok_or(ParseError::MissingField("PID"))?;

    // Demographics are optional; an unparseable DOB is rejected rather than guessed
    let date_of_birth = match pid.field(7) {
        Some(raw) => Some(parse_date(raw).ok_or_else(|| ParseError::InvalidValue {
            field: "PID-7",
            value: raw.to_string(),
        })?),
        None => None,
    };
    let sex = pid.field(8).and_then(Sex::from_code);

    Ok(AdmissionEvent {
        mrn,
        sex,
        date_of_birth,
    })
}

fn parse_lab_result(message: &Message) -> Result<ClinicalEvent, ParseError> {
    let mrn = parse_mrn(message)?;

    let obx = message.segment("OBX").ok_or(ParseError::MissingField("OBX"))?;
    let test_code = obx.field(3).ok_or(ParseError::MissingField("OBX-3"))?;
    // OBX-3 may carry components (CODE^Description); the identifier comes first
    let test_code = test_code.split('^').next().unwrap_or(test_code).to_string();

    if !test_code.eq_ignore_ascii_case(CREATININE_CODE) {
        return Ok(ClinicalEvent::Discarded { mrn, test_code });
    }

    let raw_test_time = message
        .segment("OBR")
        .and_then(|obr| obr.field(7))
        .ok_or(ParseError::MissingField("OBR-7"))?
        .to_string();
    let test_date = parse_timestamp(&raw_test_time).ok_or_else(|| ParseError::InvalidValue {
        field: "OBR-7",
        value: raw_test_time.clone(),
    })?;

    let raw_result = obx.field(5).ok_or(ParseError::MissingField("OBX-5"))?;
    let result = parse_result(raw_result).ok_or_else(|| ParseError::InvalidValue {
        field: "OBX-5",
        value: raw_result.to_string(),
    })?;

    Ok(ClinicalEvent::LabResult(LabResultEvent {
        mrn,
        test_date,
        result,
        raw_test_time,
    }))
}

/// Lenient numeric parse: tolerates surrounding whitespace and zero padding,
/// rejects anything that is not a finite number.
pub fn parse_result(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.clamp(MIN_RESULT, MAX_RESULT))
}

/// HL7 date `YYYYMMDD`; trailing time components are ignored
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let digits = raw.trim().get(..8)?;
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

/// HL7 timestamp `YYYYMMDDHHMMSS`, `YYYYMMDDHHMM` or bare `YYYYMMDD`
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    match raw.len() {
        14 => NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S").ok(),
        12 => NaiveDateTime::parse_from_str(&format!("{}00", raw), "%Y%m%d%H%M%S").ok(),
        8 => parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)),
        _ => None,
    }
}

/// HL7 acknowledgement codes written in MSA-1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Application accept
    Accept,
    /// Application error: message understood to be bad, do not resend
    Error,
    /// Application reject: frame could not be read
    Reject,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::Accept => "AA",
            AckCode::Error => "AE",
            AckCode::Reject => "AR",
        }
    }
}

/// Build the ACK message text for the given code
pub fn build_ack(code: AckCode, now: NaiveDateTime) -> String {
    format!(
        "MSH|^~\\&|||||{}||ACK|||2.5\rMSA|{}",
        now.format("%Y%m%d%H%M%S"),
        code.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMISSION: &str = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||202401201630||ADT^A01|||2.5\rPID|1||478237423||DOE^JOHN||19840203|M";
    const DISCHARGE: &str = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||202401221000||ADT^A03|||2.5\rPID|1||478237423";
    const LAB: &str = "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||20240102135300||ORU^R01|||2.5\rPID|1||497030\rOBR|1||||||20240102135300\rOBX|1|SN|CREATININE||103.4";

    #[test]
    fn test_parse_admission() {
        let event = parse(ADMISSION.as_bytes()).unwrap();
        assert_eq!(
            event,
            ClinicalEvent::Admission(AdmissionEvent {
                mrn: 478237423,
                sex: Some(Sex::Male),
                date_of_birth: NaiveDate::from_ymd_opt(1984, 2, 3),
            })
        );
    }

    #[test]
    fn test_parse_lab_result() {
        match parse(LAB.as_bytes()).unwrap() {
            ClinicalEvent::LabResult(lab) => {
                assert_eq!(lab.mrn, 497030);
                assert!((lab.result - 103.4).abs() < 1e-9);
                assert_eq!(lab.raw_test_time, "20240102135300");
                assert_eq!(
                    lab.test_date,
                    NaiveDateTime::parse_from_str("2024-01-02 13:53:00", "%Y-%m-%d %H:%M:%S")
                        .unwrap()
                );
            }
            other => panic!("expected lab result, got {:?}", other),
        }
    }

    #[test]
    fn test_admission_with_message_structure() {
        let msg = ADMISSION.replace("ADT^A01|", "ADT^A01^ADT_A01|");
        match parse(msg.as_bytes()).unwrap() {
            ClinicalEvent::Admission(admission) => {
                assert_eq!(admission.mrn, 478237423);
                assert_eq!(admission.sex, Some(Sex::Male));
            }
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[test]
    fn test_message_type_components() {
        assert!(is_message_type("ADT^A01", "ADT", Some("A01")));
        assert!(is_message_type("ADT^A01^ADT_A01", "ADT", Some("A01")));
        assert!(!is_message_type("ADT^A011", "ADT", Some("A01")));
        assert!(!is_message_type("ADT^A03", "ADT", Some("A01")));
        assert!(is_message_type("ORU^R01^ORU_R01", "ORU", None));
        assert!(!is_message_type("ORUX^R01", "ORU", None));
    }

    #[test]
    fn test_discharge_needs_ack_only() {
        assert_eq!(
            parse(DISCHARGE.as_bytes()).unwrap(),
            ClinicalEvent::DischargeOrUnhandled {
                message_type: "ADT^A03".to_string()
            }
        );
    }

    #[test]
    fn test_non_creatinine_is_discarded() {
        let msg = LAB.replace("CREATININE", "POTASSIUM");
        assert_eq!(
            parse(msg.as_bytes()).unwrap(),
            ClinicalEvent::Discarded {
                mrn: 497030,
                test_code: "POTASSIUM".to_string()
            }
        );
    }

    #[test]
    fn test_missing_mrn() {
        let msg = LAB.replace("PID|1||497030", "PID|1||");
        assert_eq!(parse(msg.as_bytes()), Err(ParseError::MissingField("PID-3")));
    }

    #[test]
    fn test_non_numeric_result_is_error_not_zero() {
        let msg = LAB.replace("103.4", "abc");
        assert!(matches!(
            parse(msg.as_bytes()),
            Err(ParseError::InvalidValue { field: "OBX-5", .. })
        ));

        let msg = LAB.replace("103.4", "");
        assert_eq!(parse(msg.as_bytes()), Err(ParseError::MissingField("OBX-5")));
    }

    #[test]
    fn test_result_parsing_is_lenient() {
        assert_eq!(parse_result(" 0099.50 "), Some(99.5));
        assert_eq!(parse_result("612"), Some(MAX_RESULT));
        assert_eq!(parse_result("-3"), Some(MIN_RESULT));
        assert_eq!(parse_result("NaN"), None);
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_timestamp("202401201630").is_some());
        assert!(parse_timestamp("20240120163000").is_some());
        assert!(parse_timestamp("20240120").is_some());
        assert!(parse_timestamp("2024").is_none());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(parse(b"hello world"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse(b""), Err(ParseError::Malformed(_))));
        assert!(matches!(parse(&[0xff, 0xfe]), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_ack_text() {
        let now = NaiveDateTime::parse_from_str("2024-01-20 16:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(
            build_ack(AckCode::Accept, now),
            "MSH|^~\\&|||||20240120163000||ACK|||2.5\rMSA|AA"
        );
        assert!(build_ack(AckCode::Reject, now).ends_with("MSA|AR"));
    }
}
