// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use chrono::offset::FixedOffset;
use chrono::offset::TimeZone as _;
use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;

use serde::de::Deserializer;
use serde::de::Error;
use serde::de::Unexpected;
use serde::Deserialize;

/// The format used for time stamps such as a token's expiry.
const FORMAT: &str = "%Y%m%d%H%M%S";
/// Korea Standard Time's offset from UTC, in seconds.
const KST_OFFSET: i32 = 9 * 60 * 60;


/// Parse a `YYYYMMDDHHMMSS` time stamp in Korea Standard Time.
pub(crate) fn parse_kst(time: &str) -> Option<DateTime<Utc>> {
  let kst = FixedOffset::east_opt(KST_OFFSET)?;
  let naive = NaiveDateTime::parse_from_str(time, FORMAT).ok()?;
  let datetime = kst.from_local_datetime(&naive).single()?;
  Some(datetime.with_timezone(&Utc))
}


/// Deserialize a Korea Standard Time time stamp as a UTC `DateTime`.
pub(crate) fn kst_from_str<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
  D: Deserializer<'de>,
{
  let time = String::deserialize(deserializer)?;
  parse_kst(&time).ok_or_else(|| {
    Error::invalid_value(Unexpected::Str(&time), &"a YYYYMMDDHHMMSS time stamp")
  })
}
