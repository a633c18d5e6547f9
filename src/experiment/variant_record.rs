//! Variant Record - one arm of an experiment

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One arm of an experiment with its visitor/conversion counters.
///
/// `conversions <= visitors` always holds; `conversion_rate` is kept in sync
/// with the counters on every write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    id: String,
    name: String,
    is_control: bool,
    visitors: u64,
    conversions: u64,
    conversion_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    traffic_percentage: Option<f64>,
}

impl Variant {
    /// Create a variant with zeroed counters.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, is_control: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_control,
            visitors: 0,
            conversions: 0,
            conversion_rate: 0.0,
            traffic_percentage: None,
        }
    }

    /// Create a variant with initial counters.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if `conversions > visitors`.
    pub fn with_counts(
        id: impl Into<String>,
        name: impl Into<String>,
        is_control: bool,
        visitors: u64,
        conversions: u64,
    ) -> Result<Self> {
        let mut variant = Self::new(id, name, is_control);
        variant.set_counts(visitors, conversions)?;
        Ok(variant)
    }

    /// Set the share of experiment traffic (percent) routed to this variant.
    #[must_use]
    pub const fn with_traffic_percentage(mut self, percentage: Option<f64>) -> Self {
        self.traffic_percentage = percentage;
        self
    }

    /// Get the variant ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the variant name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the baseline variant.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        self.is_control
    }

    /// Visitors seen so far.
    #[must_use]
    pub const fn visitors(&self) -> u64 {
        self.visitors
    }

    /// Conversions seen so far.
    #[must_use]
    pub const fn conversions(&self) -> u64 {
        self.conversions
    }

    /// `conversions / visitors`, or 0 without visitors.
    #[must_use]
    pub const fn conversion_rate(&self) -> f64 {
        self.conversion_rate
    }

    /// Configured traffic share (percent), `None` for an even split.
    #[must_use]
    pub const fn traffic_percentage(&self) -> Option<f64> {
        self.traffic_percentage
    }

    /// Replace both counters.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if `conversions > visitors`; the variant is
    /// left unchanged.
    pub fn set_counts(&mut self, visitors: u64, conversions: u64) -> Result<()> {
        if conversions > visitors {
            return Err(Error::Validation(format!(
                "variant '{}' has more conversions ({conversions}) than visitors ({visitors})",
                self.name
            )));
        }
        self.visitors = visitors;
        self.conversions = conversions;
        self.refresh_rate();
        Ok(())
    }

    /// Add simulated traffic. `conversions` is capped at `visitors`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Other` if a counter would overflow; the variant is
    /// left unchanged.
    pub(crate) fn record_traffic(&mut self, visitors: u64, conversions: u64) -> Result<()> {
        let overflow = || Error::Other(format!("variant '{}' counter overflow", self.name));
        let visitors_total = self.visitors.checked_add(visitors).ok_or_else(overflow)?;
        let conversions_total = self
            .conversions
            .checked_add(conversions.min(visitors))
            .ok_or_else(overflow)?;

        self.visitors = visitors_total;
        self.conversions = conversions_total;
        self.refresh_rate();
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn refresh_rate(&mut self) {
        self.conversion_rate = if self.visitors == 0 {
            0.0
        } else {
            self.conversions as f64 / self.visitors as f64
        };
    }
}
