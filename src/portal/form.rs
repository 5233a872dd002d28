//! Generic JSON-field form filler
//!
//! A minimal [`FormFiller`](super::FormFiller) that types each string field
//! of the payload into the input named after it, submits, and watches for a
//! confirmation marker. Vendor-specific flows replace this with their own
//! implementation; the scheduler only sees the structured outcome either
//! way.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{FormFiller, FormOutcome};
use crate::driver::Driver;
use crate::error::FailureStage;

/// Wait after submit before looking for the confirmation marker
const SUBMIT_SETTLE: Duration = Duration::from_secs(2);
/// Confirmation re-checks before declaring the submission lost
const CONFIRMATION_CHECKS: u32 = 5;

pub struct BasicFormFiller {
    submit_selector: String,
    confirmation_marker: String,
}

impl BasicFormFiller {
    #[must_use]
    pub fn new(submit_selector: impl Into<String>, confirmation_marker: impl Into<String>) -> Self {
        Self {
            submit_selector: submit_selector.into(),
            confirmation_marker: confirmation_marker.into(),
        }
    }
}

#[async_trait]
impl FormFiller for BasicFormFiller {
    async fn fill_and_submit(
        &self,
        driver: &dyn Driver,
        form_data: &serde_json::Value,
    ) -> anyhow::Result<FormOutcome> {
        let Some(fields) = form_data.as_object() else {
            return Ok(FormOutcome::failed(
                FailureStage::PreSubmission,
                "form payload is not an object",
            ));
        };

        // Everything up to the submit click is pre-submission by definition
        for (key, value) in fields {
            let Some(text) = value.as_str() else {
                debug!("Skipping non-string form field {key}");
                continue;
            };
            let selector = format!("[name={key}]");
            if let Err(e) = driver.type_into(&selector, text).await {
                return Ok(FormOutcome::failed(
                    FailureStage::PreSubmission,
                    format!("failed to fill field {key}: {e}"),
                ));
            }
        }

        if let Err(e) = driver.click(&self.submit_selector).await {
            return Ok(FormOutcome::failed(
                FailureStage::PreSubmission,
                format!("failed to submit form: {e}"),
            ));
        }

        // The portal has the submission from here on; failures are terminal
        for _ in 0..CONFIRMATION_CHECKS {
            driver.sleep(SUBMIT_SETTLE).await;
            match driver.find(&self.confirmation_marker).await {
                Ok(true) => return Ok(FormOutcome::success()),
                Ok(false) => {}
                Err(e) => {
                    return Ok(FormOutcome::failed(
                        FailureStage::PostSubmission,
                        format!("confirmation check failed: {e}"),
                    ));
                }
            }
        }

        Ok(FormOutcome::failed(
            FailureStage::PostSubmission,
            "confirmation marker never appeared after submit",
        ))
    }
}
