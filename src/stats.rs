//! Read-only dashboard queries. Consumed by the web UI and the `stats`
//! CLI command; nothing here mutates state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;

use crate::error::Error;
use crate::model::{Campaign, LeadStatus, ResponseRecord};
use crate::store::Store;

/// Top-level dashboard numbers.
#[derive(Debug, Clone)]
pub struct DashboardStats {
    pub leads_by_status: Vec<(LeadStatus, i64)>,
    pub total_leads: i64,
    pub sent_today: i64,
    pub total_responses: i64,
    pub campaigns: Vec<CampaignReport>,
}

/// Per-campaign breakdown.
#[derive(Debug, Clone)]
pub struct CampaignReport {
    pub campaign: Campaign,
    pub step_count: usize,
    pub enrolled: usize,
    pub halted: usize,
    pub completed: usize,
    pub sent: i64,
    pub responses: i64,
    /// Responses per sent email, 0.0 when nothing was sent.
    pub response_rate: f64,
}

pub async fn dashboard_stats(
    store: &Arc<dyn Store>,
    now: DateTime<Utc>,
) -> Result<DashboardStats, Error> {
    let leads_by_status = store.lead_counts_by_status().await?;
    let total_leads = leads_by_status.iter().map(|(_, n)| n).sum();

    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now);
    let sent_today = store.total_sent_since(day_start).await?;
    let total_responses = store.response_count().await?;

    let all = store.campaigns().await?;
    let campaigns = try_join_all(all.iter().map(|c| campaign_report(store, c))).await?;

    Ok(DashboardStats {
        leads_by_status,
        total_leads,
        sent_today,
        total_responses,
        campaigns,
    })
}

pub async fn campaign_report(
    store: &Arc<dyn Store>,
    campaign: &Campaign,
) -> Result<CampaignReport, Error> {
    let steps = store.campaign_steps(campaign.id).await?;
    let enrollments = store.enrollments_for_campaign(campaign.id).await?;
    let step_count = steps.len();

    let halted = enrollments.iter().filter(|e| e.halted).count();
    let completed = enrollments
        .iter()
        .filter(|e| e.is_complete(step_count as i64))
        .count();

    let sent = store.sent_count_for_campaign(campaign.id).await?;
    let responses = store.response_count_for_campaign(campaign.id).await?;

    Ok(CampaignReport {
        campaign: campaign.clone(),
        step_count,
        enrolled: enrollments.len(),
        halted,
        completed,
        sent,
        responses,
        response_rate: response_rate(sent, responses),
    })
}

/// Responses filtered by review/orphan state, newest first.
pub async fn list_responses(
    store: &Arc<dyn Store>,
    needs_review: Option<bool>,
    unmatched: Option<bool>,
    limit: i64,
) -> Result<Vec<ResponseRecord>, Error> {
    Ok(store.list_responses(needs_review, unmatched, limit).await?)
}

fn response_rate(sent: i64, responses: i64) -> f64 {
    if sent <= 0 {
        0.0
    } else {
        responses as f64 / sent as f64
    }
}
