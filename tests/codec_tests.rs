use healthbus::protocol::*;
use healthbus::telemetry::{TelemetryDecoder, TelemetryHistory};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn addr(value: u8) -> PeripheralAddress {
    PeripheralAddress::new(value).unwrap()
}

fn tag(letter: char) -> DeviceTag {
    DeviceTag::new(letter).unwrap()
}

fn decoder() -> TelemetryDecoder {
    TelemetryDecoder::new([addr(1), addr(2)])
}

#[test]
fn test_decode_reference_line() {
    let message = decoder()
        .decode("1A78.45 B83.82 K0.13,-0.39,-9.81 U14.41\n")
        .unwrap();

    assert_eq!(message.address(), addr(1));
    assert_eq!(message.len(), 4);
    assert_eq!(
        message.get(tag('A')),
        Some(Reading::Scalar(Decimal2::from_hundredths(7845).unwrap()))
    );
    assert_eq!(
        message.get(tag('K')),
        Reading::triaxial(0.13, -0.39, -9.81)
    );
    assert_eq!(message.get(tag('U')), Reading::scalar(14.41));
    assert_eq!(message.get(tag('C')), None);
}

#[test]
fn test_encode_matches_wire_format() {
    let message = TelemetryMessage::new(addr(1))
        .with(tag('A'), Reading::scalar(78.45).unwrap())
        .unwrap()
        .with(tag('B'), Reading::scalar(83.82).unwrap())
        .unwrap()
        .with(tag('K'), Reading::triaxial(0.13, -0.39, -9.81).unwrap())
        .unwrap()
        .with(tag('U'), Reading::scalar(14.41).unwrap())
        .unwrap();

    let line = message.encode_line().unwrap();
    assert_eq!(line.as_str(), "1A78.45 B83.82 K0.13,-0.39,-9.81 U14.41\n");
    assert_eq!(decoder().decode(&line).unwrap(), message);
}

#[test]
fn test_unavailable_reading_survives_the_wire() {
    let message = TelemetryMessage::new(addr(2))
        .with(tag('A'), Reading::Unavailable)
        .unwrap()
        .with(tag('K'), Reading::Unavailable)
        .unwrap();
    let line = message.encode_line().unwrap();
    assert_eq!(line.as_str(), "2Anan Knan\n");

    let decoded = decoder().decode(&line).unwrap();
    assert_eq!(decoded.get(tag('A')), Some(Reading::Unavailable));
    assert_eq!(decoded.get(tag('K')), Some(Reading::Unavailable));
    assert!(!decoded.get(tag('K')).unwrap().is_available());
}

#[test]
fn test_address_only_line_is_an_empty_record() {
    let message = decoder().decode("2\n").unwrap();
    assert_eq!(message.address(), addr(2));
    assert!(message.is_empty());
}

#[test]
fn test_invalid_value_yields_no_record() {
    let result = decoder().decode("1Zxx\n");
    assert_eq!(
        result,
        Err(MalformedMessage::InvalidValue {
            tag: 'Z',
            text: "xx".to_string()
        })
    );

    let mut history = TelemetryHistory::default();
    if let Ok(message) = result {
        history.record(0, &message);
    }
    assert_eq!(history.recorded_messages(), 0);
    assert_eq!(history.tags(addr(1)).count(), 0);
}

#[test]
fn test_malformed_lines_rejected() {
    let decoder = decoder();
    let cases: [(&str, MalformedMessage); 9] = [
        ("\n", MalformedMessage::Empty),
        ("A78.45\n", MalformedMessage::MissingAddress),
        ("12A1.00\n", MalformedMessage::InvalidAddress("12".to_string())),
        ("7A1.00\n", MalformedMessage::UnknownAddress(addr(7))),
        ("1a1.00\n", MalformedMessage::UnknownTag('a')),
        ("1A1.00 A2.00\n", MalformedMessage::DuplicateTag('A')),
        (
            "1K1.00,2.00\n",
            MalformedMessage::WrongArity {
                tag: 'K',
                expected: 3,
                found: 2,
            },
        ),
        (
            "1A1.00,2.00,3.00\n",
            MalformedMessage::WrongArity {
                tag: 'A',
                expected: 1,
                found: 3,
            },
        ),
        ("1A78.45\u{b0}\n", MalformedMessage::NotAscii),
    ];

    for (line, expected) in cases {
        assert_eq!(decoder.decode(line), Err(expected), "line {:?}", line);
    }
}

#[test]
fn test_non_finite_values_rejected() {
    let decoder = decoder();
    for line in ["1Ainf\n", "1ANaN\n", "1A\n", "1K1.0,,2.0\n"] {
        assert!(
            matches!(decoder.decode(line), Err(MalformedMessage::InvalidValue { .. })),
            "line {:?}",
            line
        );
    }
}

#[test]
fn test_overlong_line_rejected() {
    let mut line = String::from("1");
    while line.len() <= MAX_LINE_LEN {
        line.push_str(" A1.00");
    }
    assert_eq!(
        decoder().decode(&line),
        Err(MalformedMessage::LineTooLong { limit: MAX_LINE_LEN })
    );
}

#[test]
fn test_values_need_exactly_two_decimals() {
    let decoder = decoder();
    for line in ["1A78.456\n", "1U14.4\n", "1A1e2\n", "1A+5\n", "1A78\n", "1K0.13,-0.39,-9.8\n"] {
        assert!(
            matches!(decoder.decode(line), Err(MalformedMessage::InvalidValue { .. })),
            "line {:?}",
            line
        );
    }
    let message = decoder.decode("1A-0.50 U0.00\n").unwrap();
    assert_eq!(message.to_string(), "1A-0.50 U0.00");
}

fn random_value(rng: &mut StdRng) -> Decimal2 {
    let hundredths = match rng.gen_range(0..6) {
        0 => Decimal2::MAX_HUNDREDTHS,
        1 => -Decimal2::MAX_HUNDREDTHS,
        2 => 0,
        3 => rng.gen_range(-99..=99),
        _ => rng.gen_range(-Decimal2::MAX_HUNDREDTHS..=Decimal2::MAX_HUNDREDTHS),
    };
    Decimal2::from_hundredths(hundredths).unwrap()
}

fn random_message(rng: &mut StdRng, address: PeripheralAddress) -> TelemetryMessage {
    let mut letters: Vec<char> = ('A'..='Z').collect();
    letters.shuffle(rng);
    let count = rng.gen_range(0..=letters.len());

    let mut message = TelemetryMessage::new(address);
    for letter in &letters[..count] {
        let tag = tag(*letter);
        let reading = if rng.gen_bool(0.15) {
            Reading::Unavailable
        } else if tag.class() == DeviceClass::Acceleration {
            Reading::Triaxial([random_value(rng), random_value(rng), random_value(rng)])
        } else {
            Reading::Scalar(random_value(rng))
        };
        message.push(tag, reading).unwrap();
    }
    message
}

#[test]
fn test_random_messages_survive_the_wire() {
    let decoder = TelemetryDecoder::new((0..=9).map(addr));
    let mut rng = StdRng::seed_from_u64(0x485);

    for round in 0..500 {
        let address = match round % 4 {
            0 => addr(0),
            1 => addr(9),
            _ => addr(rng.gen_range(0..=9)),
        };
        let message = random_message(&mut rng, address);
        let line = message.encode_line().unwrap();
        assert_eq!(decoder.decode(&line), Ok(message), "line {:?}", line.as_str());
    }

    for value in [0, 9] {
        let empty = TelemetryMessage::new(addr(value));
        let line = empty.encode_line().unwrap();
        assert_eq!(decoder.decode(&line), Ok(empty));
    }
}

#[test]
fn test_decode_bytes_rejects_invalid_utf8() {
    assert_eq!(
        decoder().decode_bytes(&[b'1', b'A', 0xff, b'\n']),
        Err(MalformedMessage::NotAscii)
    );
}

#[test]
fn test_json_rendering() {
    let message = decoder().decode("1A78.45 Knan\n").unwrap();
    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(json["address"], 1);
    assert_eq!(json["fields"][0]["tag"], "A");
    assert_eq!(json["fields"][0]["reading"], 78.45);
    assert!(json["fields"][1]["reading"].is_null());
}
