//! Scripted fetcher shared by the unit tests

use async_trait::async_trait;
use cdrsync_core::models::RawCdr;
use cdrsync_core::traits::{CdrFetcher, CdrPage};
use cdrsync_core::{AppError, AppResult};
use chrono::NaiveDate;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;

/// Pages per window start day; page `i` is served at the offset equal to
/// the number of records on pages `0..i`
#[derive(Default)]
pub struct ScriptedFetcher {
    days: Mutex<HashMap<NaiveDate, (Vec<Vec<RawCdr>>, Option<usize>)>>,
}

impl ScriptedFetcher {
    pub fn with_pages(self, day: NaiveDate, pages: Vec<Vec<RawCdr>>) -> Self {
        self.days.lock().unwrap().insert(day, (pages, None));
        self
    }

    pub fn failing_at(self, day: NaiveDate, pages: Vec<Vec<RawCdr>>, page: usize) -> Self {
        self.days.lock().unwrap().insert(day, (pages, Some(page)));
        self
    }
}

#[async_trait]
impl CdrFetcher for ScriptedFetcher {
    async fn fetch_page(
        &self,
        date_from: NaiveDate,
        _date_to: NaiveDate,
        offset: i64,
    ) -> AppResult<CdrPage> {
        let days = self.days.lock().unwrap();
        let Some((pages, fail_at)) = days.get(&date_from) else {
            return Ok(CdrPage::default());
        };

        let mut start = 0i64;
        for (i, page) in pages.iter().enumerate() {
            if start == offset {
                if *fail_at == Some(i) {
                    return Err(AppError::Timeout(60));
                }
                let end = start + page.len() as i64;
                return Ok(CdrPage {
                    records: page.clone(),
                    next_offset: (i + 1 < pages.len()).then_some(end),
                    total: None,
                });
            }
            start += page.len() as i64;
        }

        Ok(CdrPage::default())
    }
}

/// A valid upstream record starting at `start_epoch`
pub fn cdr(uuid: &str, start_epoch: i64) -> RawCdr {
    RawCdr::new(json!({
        "uuid": uuid,
        "direction": "inbound",
        "caller_id_number": "0909123456",
        "destination_number": "1001",
        "start_epoch": start_epoch,
        "duration": 40,
        "billsec": 30,
        "call_status": "ANSWERED",
    }))
}

/// A record every store rejects
pub fn bad_cdr(uuid: &str, start_epoch: i64) -> RawCdr {
    RawCdr::new(json!({
        "uuid": uuid,
        "start_epoch": start_epoch,
        "duration": 10,
        "billsec": 99,
    }))
}
