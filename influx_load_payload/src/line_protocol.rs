//! InfluxDB line protocol serialization.
//!
//! Each [`Point`] becomes one line of the form
//!
//! ```text
//! measurement[,tag=value...] field=value[,field=value...] timestamp
//! ```
//!
//! Tags are written sorted by key, which is the order InfluxDB prefers and
//! avoids a server-side sort. Timestamps are nanoseconds.

use std::io::Write;

use crate::{Error, Point};

/// Write `point` to `writer` as a single newline terminated line.
///
/// # Errors
///
/// Returns [`Error::NonFinite`] if a field value is NaN or infinite, and
/// [`Error::Io`] if the writer fails.
pub fn encode<W>(point: &Point<'_>, writer: &mut W) -> Result<(), Error>
where
    W: Write,
{
    if let Some(field) = point.fields.iter().find(|f| !f.value.is_finite()) {
        return Err(Error::NonFinite {
            field: field.name.to_string(),
            value: field.value,
        });
    }

    write_escaped(writer, point.measurement, &[',', ' '])?;

    let mut tags: Vec<_> = point.tags.iter().collect();
    tags.sort_unstable_by_key(|t| t.name.as_str());
    for tag in tags {
        writer.write_all(b",")?;
        write_escaped(writer, tag.name.as_str(), &[',', '=', ' '])?;
        writer.write_all(b"=")?;
        write_escaped(writer, &tag.value, &[',', '=', ' '])?;
    }

    for (i, field) in point.fields.iter().enumerate() {
        writer.write_all(if i == 0 { b" " } else { b"," })?;
        write_escaped(writer, field.name, &[',', '=', ' '])?;
        write!(writer, "={}", field.value)?;
    }

    writeln!(writer, " {}", point.timestamp)?;
    Ok(())
}

fn write_escaped<W>(writer: &mut W, value: &str, special: &[char]) -> Result<(), Error>
where
    W: Write,
{
    let mut start = 0;
    for (idx, c) in value.char_indices() {
        if special.contains(&c) {
            writer.write_all(value[start..idx].as_bytes())?;
            writer.write_all(b"\\")?;
            start = idx;
        }
    }
    writer.write_all(value[start..].as_bytes())?;
    Ok(())
}
