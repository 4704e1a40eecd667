//! RFC 3339 timestamps as persisted in `createdDate` / `updatedDate`.

use time::{
    format_description::{well_known::Rfc3339, FormatItem},
    macros::format_description,
    OffsetDateTime, UtcOffset,
};

/// Millisecond precision, always UTC with a `Z` suffix.
const STORED_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn format(ts: OffsetDateTime) -> String {
    let utc = ts.to_offset(UtcOffset::UTC);
    utc.format(STORED_FORMAT)
        .or_else(|_| utc.format(&Rfc3339))
        .unwrap_or_else(|_| utc.unix_timestamp().to_string())
}

pub fn parse(text: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(text, &Rfc3339)
}

pub fn now_string() -> String {
    format(now())
}
