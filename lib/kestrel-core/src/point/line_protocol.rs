use std::io::Write as _;

use super::{FieldValue, Point};

/// Appends the line protocol encoding of `point` to `buf`, without a trailing newline.
///
/// The encoding is `measurement[,tag=value...] field=value[,field=value...] timestamp`, with integers suffixed by `i`
/// (signed) or `u` (unsigned) and strings quoted. Tags with an empty key or value cannot be represented and are
/// left out.
pub fn write_line_protocol(point: &Point, buf: &mut Vec<u8>) {
    escape_into(buf, point.measurement(), &[b',', b' ']);

    for (key, value) in point.tags().iter().filter(|(k, v)| !k.is_empty() && !v.is_empty()) {
        buf.push(b',');
        escape_into(buf, key, &[b',', b'=', b' ']);
        buf.push(b'=');
        escape_into(buf, value, &[b',', b'=', b' ']);
    }

    buf.push(b' ');
    for (i, (key, value)) in point.fields().iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        escape_into(buf, key, &[b',', b'=', b' ']);
        buf.push(b'=');
        write_field_value(buf, value);
    }

    buf.push(b' ');
    let _ = write!(buf, "{}", point.timestamp_ns());
}

fn write_field_value(buf: &mut Vec<u8>, value: &FieldValue) {
    // Writes into a `Vec` cannot fail.
    let _ = match value {
        FieldValue::Int(v) => write!(buf, "{}i", v),
        FieldValue::UInt(v) => write!(buf, "{}u", v),
        FieldValue::Float(v) => write!(buf, "{:?}", v),
        FieldValue::Bool(v) => write!(buf, "{}", v),
        FieldValue::String(v) => {
            buf.push(b'"');
            escape_into(buf, v, &[b'"']);
            buf.push(b'"');
            Ok(())
        }
    };
}

fn escape_into(buf: &mut Vec<u8>, value: &str, special: &[u8]) {
    for &b in value.as_bytes() {
        if b == b'\\' || special.contains(&b) {
            buf.push(b'\\');
        }
        if b == b'\n' {
            buf.extend_from_slice(b"\\n");
            continue;
        }
        buf.push(b);
    }
}
