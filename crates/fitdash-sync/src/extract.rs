//! Extraction strategies: one API call, cursor pagination, limit/offset paging,
//! and day or date-range backfill loops.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fitdash_adapters::{ApiArgs, ApiClient, ClientError, ParamTemplate, TemplateValues};
use fitdash_core::{non_placeholder, LoopType, Task};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::config::ExtractLimits;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DEFAULT_PAGE_LIMIT: u64 = 50;

/// Suspension point between consecutive API calls.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct ExtractRequest<'a> {
    pub client: &'a dyn ApiClient,
    pub function: &'a str,
    pub template: ParamTemplate,
    pub now: DateTime<Utc>,
    pub today: NaiveDate,
    pub recency: Option<NaiveDate>,
    pub limits: ExtractLimits,
}

impl ExtractRequest<'_> {
    fn args(&self) -> ApiArgs {
        self.template.render(&TemplateValues::at(self.now))
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(
        &self,
        request: &ExtractRequest<'_>,
        pacer: &dyn Pacer,
    ) -> Result<Vec<JsonValue>, ClientError>;
}

/// Flattens one response into records: arrays are spread, `null` is dropped.
pub fn collect_records(out: &mut Vec<JsonValue>, response: JsonValue) {
    match response {
        JsonValue::Null => {}
        JsonValue::Array(items) => out.extend(items.into_iter().filter(|v| !v.is_null())),
        other => out.push(other),
    }
}

/// Records of one paginated page: its `items` array when present, else the page itself.
fn collect_page(out: &mut Vec<JsonValue>, page: &JsonValue) {
    match page.get("items") {
        Some(JsonValue::Array(items)) => out.extend(items.iter().filter(|v| !v.is_null()).cloned()),
        _ => collect_records(out, page.clone()),
    }
}

fn has_next(page: &JsonValue) -> bool {
    match page.get("next") {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Bool(flag)) => *flag,
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Dates to backfill, oldest first: from the recency date (re-fetched since it
/// may be partial) through today, at most `max_batch_days` of them.
pub fn plan_days(recency: Option<NaiveDate>, today: NaiveDate, max_batch_days: u32) -> Vec<NaiveDate> {
    let max_batch_days = max_batch_days.max(1);
    let start = recency.unwrap_or_else(|| {
        today - chrono::Duration::days(i64::from(max_batch_days) - 1)
    });
    let days: Vec<NaiveDate> = start
        .iter_days()
        .take_while(|d| *d <= today)
        .take(max_batch_days as usize)
        .collect();
    if days.is_empty() {
        vec![today]
    } else {
        days
    }
}

/// The same span as [`plan_days`], split into `(from, to)` pairs of at most `span_days`.
pub fn plan_ranges(
    recency: Option<NaiveDate>,
    today: NaiveDate,
    max_batch_days: u32,
    span_days: u32,
) -> Vec<(NaiveDate, NaiveDate)> {
    if recency.is_some_and(|r| r > today) {
        return vec![(today - chrono::Duration::days(1), today)];
    }
    plan_days(recency, today, max_batch_days)
        .chunks(span_days.max(1) as usize)
        .filter_map(|chunk| Some((*chunk.first()?, *chunk.last()?)))
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleCall;

#[async_trait]
impl Extractor for SingleCall {
    fn name(&self) -> &'static str {
        "single_call"
    }

    async fn extract(
        &self,
        request: &ExtractRequest<'_>,
        _pacer: &dyn Pacer,
    ) -> Result<Vec<JsonValue>, ClientError> {
        let mut records = Vec::new();
        let response = request.client.call(request.function, &request.args()).await?;
        collect_records(&mut records, response);
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NextCursor;

#[async_trait]
impl Extractor for NextCursor {
    fn name(&self) -> &'static str {
        "next_loop"
    }

    async fn extract(
        &self,
        request: &ExtractRequest<'_>,
        pacer: &dyn Pacer,
    ) -> Result<Vec<JsonValue>, ClientError> {
        let mut records = Vec::new();
        let mut page = request.client.call(request.function, &request.args()).await?;
        let mut pages = 1usize;
        loop {
            collect_page(&mut records, &page);
            if !has_next(&page) {
                break;
            }
            if pages >= request.limits.max_pages as usize {
                warn!(pages, "page limit reached; stopping pagination");
                break;
            }
            pacer.pause(request.limits.next_cooldown).await;
            page = match request.client.next_page(&page).await {
                Ok(next) => next,
                Err(err @ ClientError::RateLimited { .. }) => return Err(err),
                Err(err) => {
                    warn!(error = %err, pages, "stopping pagination");
                    break;
                }
            };
            pages += 1;
        }
        debug!(pages, records = records.len(), "cursor pagination complete");
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LimitOffset;

#[async_trait]
impl Extractor for LimitOffset {
    fn name(&self) -> &'static str {
        "limit_offset"
    }

    async fn extract(
        &self,
        request: &ExtractRequest<'_>,
        pacer: &dyn Pacer,
    ) -> Result<Vec<JsonValue>, ClientError> {
        let base = request.args();
        let limit = base
            .named("limit")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_PAGE_LIMIT);
        let mut offset = base
            .named("offset")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let mut records = Vec::new();
        let mut pages = 0usize;
        loop {
            let args = base
                .clone()
                .with_named("limit", limit.to_string())
                .with_named("offset", offset.to_string());
            let page = request.client.call(request.function, &args).await?;
            pages += 1;
            collect_page(&mut records, &page);
            if !has_next(&page) {
                break;
            }
            if pages >= request.limits.max_pages as usize {
                warn!(pages, offset, "page limit reached; stopping pagination");
                break;
            }
            offset += limit;
            pacer.pause(request.limits.next_cooldown).await;
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DayLoop;

#[async_trait]
impl Extractor for DayLoop {
    fn name(&self) -> &'static str {
        "day_loop"
    }

    async fn extract(
        &self,
        request: &ExtractRequest<'_>,
        pacer: &dyn Pacer,
    ) -> Result<Vec<JsonValue>, ClientError> {
        let days = plan_days(request.recency, request.today, request.limits.max_batch_days);
        let mut records = Vec::new();
        for (i, day) in days.iter().enumerate() {
            if i > 0 {
                pacer.pause(request.limits.date_cooldown).await;
            }
            let date = day.format(DATE_FORMAT).to_string();
            let values = TemplateValues::at(request.now).with_dates(date.clone(), Some(date));
            let response = request
                .client
                .call(request.function, &request.template.render(&values))
                .await?;
            collect_records(&mut records, response);
        }
        debug!(days = days.len(), records = records.len(), "day loop complete");
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeLoop;

#[async_trait]
impl Extractor for RangeLoop {
    fn name(&self) -> &'static str {
        "range_loop"
    }

    async fn extract(
        &self,
        request: &ExtractRequest<'_>,
        pacer: &dyn Pacer,
    ) -> Result<Vec<JsonValue>, ClientError> {
        let ranges = plan_ranges(
            request.recency,
            request.today,
            request.limits.max_batch_days,
            request.limits.range_span_days,
        );
        let mut records = Vec::new();
        for (i, (from, to)) in ranges.iter().enumerate() {
            if i > 0 {
                pacer.pause(request.limits.date_cooldown).await;
            }
            let values = TemplateValues::at(request.now).with_dates(
                from.format(DATE_FORMAT).to_string(),
                Some(to.format(DATE_FORMAT).to_string()),
            );
            let response = request
                .client
                .call(request.function, &request.template.render(&values))
                .await?;
            collect_records(&mut records, response);
        }
        debug!(ranges = ranges.len(), records = records.len(), "range loop complete");
        Ok(records)
    }
}

/// Picks a strategy by the task's extraction function, falling back to its loop type.
pub struct ExtractorRegistry {
    named: BTreeMap<&'static str, Arc<dyn Extractor>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            named: BTreeMap::new(),
        };
        registry.register(Arc::new(SingleCall));
        registry.register(Arc::new(NextCursor));
        registry.register(Arc::new(LimitOffset));
        registry.register(Arc::new(DayLoop));
        registry.register(Arc::new(RangeLoop));
        registry
    }
}

impl ExtractorRegistry {
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        self.named.insert(extractor.name(), extractor);
    }

    pub fn for_task(&self, task: &Task) -> Option<Arc<dyn Extractor>> {
        if let Some(reference) = non_placeholder(task.extraction_function.as_deref()) {
            return self
                .named
                .get(fitdash_adapters::short_name(reference))
                .cloned();
        }
        let name = match task.api_loop_type {
            LoopType::NoLoop => "single_call",
            LoopType::Next => "next_loop",
            LoopType::Day => "day_loop",
            LoopType::Range => "range_loop",
        };
        self.named.get(name).cloned()
    }
}
