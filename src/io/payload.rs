//! Binary payloads of the MQTT topic tree. All integers are big-endian and
//! saturate at their type's range.

use byteorder::{BigEndian, ByteOrder};

use crate::domain::{BatteryPack, DeviceStatus};

pub fn state(status: DeviceStatus) -> Vec<u8> {
    vec![u8::from(status.is_on())]
}

pub fn u8_sat(value: i64) -> Vec<u8> {
    vec![value.clamp(0, u8::MAX as i64) as u8]
}

pub fn u16_be(value: i64) -> Vec<u8> {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, value.clamp(0, u16::MAX as i64) as u16);
    buf.to_vec()
}

pub fn i16_be(value: i64) -> Vec<u8> {
    let mut buf = [0u8; 2];
    BigEndian::write_i16(&mut buf, value.clamp(i16::MIN as i64, i16::MAX as i64) as i16);
    buf.to_vec()
}

fn scaled(value: f32, factor: f32) -> i64 {
    (value as f64 * factor as f64).round() as i64
}

/// Per-pack points as (topic suffix, payload)
pub fn pack_points(pack: &BatteryPack) -> Vec<(String, Vec<u8>)> {
    let mut points = vec![
        ("v".to_string(), u16_be(scaled(pack.v, 100.0))),
        ("i".to_string(), i16_be(scaled(pack.i, 10.0))),
        ("soc".to_string(), u8_sat(scaled(pack.soc, 1.0))),
        ("c".to_string(), u16_be(scaled(pack.c, 10.0))),
        ("n".to_string(), u16_be(pack.n as i64)),
    ];
    points.extend(
        pack.temps
            .iter()
            .enumerate()
            .map(|(i, t)| (format!("temp/{i}"), i16_be(scaled(*t, 10.0)))),
    );
    points.extend(
        pack.cells
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("cell/{i}"), u16_be(scaled(*v, 1000.0)))),
    );
    points
}

/// Live consumption: int16 or int32 big-endian, dispatched on length
pub fn decode_power(payload: &[u8]) -> Option<i32> {
    match payload.len() {
        2 => Some(BigEndian::read_i16(payload) as i32),
        4 => Some(BigEndian::read_i32(payload)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::battery::fixtures::pack;

    #[test]
    fn test_scalar_encodings() {
        assert_eq!(state(DeviceStatus::On), vec![1]);
        assert_eq!(state(DeviceStatus::Syncing), vec![0]);
        assert_eq!(u16_be(500), vec![0x01, 0xF4]);
        assert_eq!(u16_be(-3), vec![0, 0]);
        assert_eq!(u16_be(70_000), vec![0xFF, 0xFF]);
        assert_eq!(i16_be(-25), vec![0xFF, 0xE7]);
        assert_eq!(u8_sat(300), vec![255]);
    }

    #[test]
    fn test_pack_points() {
        let mut p = pack("A", 50.0);
        p.i = -12.3;
        let points = pack_points(&p);
        let get = |k: &str| points.iter().find(|(s, _)| s == k).map(|(_, v)| v.clone()).unwrap();
        assert_eq!(get("c"), vec![0x01, 0xF4]);
        assert_eq!(get("v"), u16_be(5280));
        assert_eq!(get("i"), i16_be(-123));
        assert_eq!(get("soc"), vec![64]);
        assert_eq!(get("temp/1"), i16_be(220));
        assert_eq!(get("cell/15"), u16_be(3300));
        assert_eq!(points.len(), 5 + 2 + 16);
    }

    #[test]
    fn test_decode_power() {
        assert_eq!(decode_power(&[0xFF, 0x38]), Some(-200));
        assert_eq!(decode_power(&[0x00, 0x01, 0x86, 0xA0]), Some(100_000));
        assert_eq!(decode_power(&[0x01]), None);
        assert_eq!(decode_power(b"1234567"), None);
    }
}
