use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use serde::Serialize;
use std::fmt;

use crate::chat::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DateBucket {
    #[serde(rename = "Today")]
    Today,
    #[serde(rename = "Yesterday")]
    Yesterday,
    #[serde(rename = "Last 7 Days")]
    Last7Days,
    #[serde(rename = "Last 30 Days")]
    Last30Days,
    #[serde(rename = "Older")]
    Older,
}

impl DateBucket {
    pub const ALL: [DateBucket; 5] = [
        DateBucket::Today,
        DateBucket::Yesterday,
        DateBucket::Last7Days,
        DateBucket::Last30Days,
        DateBucket::Older,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            DateBucket::Today => "Today",
            DateBucket::Yesterday => "Yesterday",
            DateBucket::Last7Days => "Last 7 Days",
            DateBucket::Last30Days => "Last 30 Days",
            DateBucket::Older => "Older",
        }
    }

    /// Classify a session date against `now`. Calendar days are taken in
    /// `now`'s timezone.
    pub fn classify<Tz: TimeZone>(date: DateTime<Utc>, now: &DateTime<Tz>) -> Self {
        let tz = now.timezone();
        let day = date.with_timezone(&tz).date_naive();
        let today = now.date_naive();

        if day == today {
            DateBucket::Today
        } else if today.pred_opt() == Some(day) {
            DateBucket::Yesterday
        } else if date > (now.clone() - Duration::days(7)).with_timezone(&Utc) {
            DateBucket::Last7Days
        } else if date > (now.clone() - Duration::days(30)).with_timezone(&Utc) {
            DateBucket::Last30Days
        } else {
            DateBucket::Older
        }
    }
}

impl fmt::Display for DateBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DateGroup<'a> {
    pub bucket: DateBucket,
    pub chats: Vec<&'a Session>,
}

/// Partition sessions into all five buckets, in bucket order. Sessions keep
/// their collection order inside a bucket; empty buckets are still returned.
pub fn group_by_date_at<'a, Tz: TimeZone>(
    sessions: &'a [Session],
    now: &DateTime<Tz>,
) -> Vec<DateGroup<'a>> {
    let mut groups: Vec<DateGroup<'a>> = DateBucket::ALL
        .iter()
        .map(|&bucket| DateGroup {
            bucket,
            chats: Vec::new(),
        })
        .collect();

    for session in sessions {
        let bucket = DateBucket::classify(session.date, now);
        groups[bucket as usize].chats.push(session);
    }

    groups
}

pub fn group_chats_by_date(sessions: &[Session]) -> Vec<DateGroup<'_>> {
    group_by_date_at(sessions, &Local::now())
}
