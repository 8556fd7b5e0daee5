//! Simulated exchange rules
//!
//! Market-hours gating and commission calculation. The calendar is
//! intentionally simple: weekdays, regular session only, evaluated in
//! the manifest's exchange timezone.

use chrono::{DateTime, Datelike, Timelike, Weekday};

use crate::models::Fill;
use crate::money::Money;
use crate::plugin::manifest::{CommissionType, HostParams};

const MARKET_OPEN_HOUR: u32 = 9;
const MARKET_CLOSE_HOUR: u32 = 16;

pub struct Exchange;

impl Exchange {
    /// Whether a bar timestamp is tradeable under the host's
    /// market-hours restriction. Unrestricted hosts accept everything.
    pub fn is_within_market_hour_restrictions(timestamp_ns: i64, host_params: &HostParams) -> bool {
        if !host_params.market_hours_only.unwrap_or(false) {
            return true;
        }

        let local = DateTime::from_timestamp_nanos(timestamp_ns).with_timezone(&host_params.tz());

        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }

        let hour = local.hour();
        hour >= MARKET_OPEN_HOUR && hour < MARKET_CLOSE_HOUR
    }

    /// Commission owed on a fill under the host's commission schedule
    pub fn calculate_commission(fill: &Fill, host_params: &HostParams) -> Money {
        let commission_value = host_params.commission.unwrap_or(0.0);
        if commission_value == 0.0 {
            return Money::ZERO;
        }

        match host_params.commission_type {
            Some(CommissionType::PerShare) => {
                Money::from_dollars(commission_value) * fill.quantity.abs()
            }
            Some(CommissionType::Percentage) => {
                (fill.price * fill.quantity.abs()) * commission_value
            }
            Some(CommissionType::Flat) => Money::from_dollars(commission_value),
            None => Money::ZERO,
        }
    }
}
