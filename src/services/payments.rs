//! Payment and refund operations behind the merchant API.
//!
//! Everything here is synchronous bookkeeping: validate, write the record,
//! enqueue a job. Outcomes are decided later by the workers.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::database::merchant_repository::Merchant;
use crate::database::payment_repository::{
    NewPayment, Payment, PaymentMethod, PaymentStatus, PaymentStore,
};
use crate::database::refund_repository::{NewRefund, Refund, RefundCreation, RefundStore};
use crate::error::{AppError, AppResult, ConflictError};
use crate::queue::{JobPayload, Queues};
use crate::utils::{generate_id, PAYMENT_ID_PREFIX, REFUND_ID_PREFIX};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePaymentRequest {
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub method: Option<String>,
    pub vpa: Option<String>,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRefundRequest {
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

fn required(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct PaymentService {
    payments: Arc<dyn PaymentStore>,
    refunds: Arc<dyn RefundStore>,
    queues: Queues,
}

impl PaymentService {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        refunds: Arc<dyn RefundStore>,
        queues: Queues,
    ) -> Self {
        Self {
            payments,
            refunds,
            queues,
        }
    }

    /// Record a pending payment and hand it to the payment worker
    pub async fn create_payment(
        &self,
        merchant: &Merchant,
        request: CreatePaymentRequest,
    ) -> AppResult<Payment> {
        let (Some(amount), Some(currency), Some(method), Some(order_id)) = (
            request.amount,
            required(request.currency),
            required(request.method),
            required(request.order_id),
        ) else {
            return Err(AppError::missing_fields());
        };

        if amount <= 0 {
            return Err(AppError::invalid_amount("must be greater than zero"));
        }
        let method = PaymentMethod::parse(&method).ok_or_else(|| {
            AppError::invalid_field("method", "must be one of card, upi, netbanking, wallet")
        })?;

        let payment = self
            .payments
            .create(NewPayment {
                id: generate_id(PAYMENT_ID_PREFIX),
                merchant_id: merchant.id,
                amount,
                currency: currency.to_uppercase(),
                method,
                vpa: required(request.vpa),
                order_id,
            })
            .await?;

        self.queues
            .dispatch(JobPayload::process_payment(payment.id.clone()), Duration::ZERO)
            .await?;

        info!(
            payment_id = %payment.id,
            merchant_id = %merchant.id,
            amount = payment.amount,
            method = %payment.method.as_str(),
            "payment created"
        );
        Ok(payment)
    }

    /// A payment owned by another merchant is reported as absent
    pub async fn get_payment(&self, merchant: &Merchant, payment_id: &str) -> AppResult<Payment> {
        self.payments
            .find_by_id(payment_id)
            .await?
            .filter(|p| p.merchant_id == merchant.id)
            .ok_or_else(|| AppError::not_found("Payment"))
    }

    pub async fn capture_payment(
        &self,
        merchant: &Merchant,
        payment_id: &str,
    ) -> AppResult<Payment> {
        let payment = self.get_payment(merchant, payment_id).await?;

        if payment.status != PaymentStatus::Success {
            return Err(AppError::conflict(ConflictError::PaymentNotCapturable));
        }
        if payment.captured {
            return Err(AppError::conflict(ConflictError::PaymentAlreadyCaptured));
        }

        // A concurrent capture may win between the read and the update
        let captured = self
            .payments
            .mark_captured(&payment.id)
            .await?
            .ok_or_else(|| AppError::conflict(ConflictError::PaymentAlreadyCaptured))?;

        info!(payment_id = %captured.id, merchant_id = %merchant.id, "payment captured");
        Ok(captured)
    }

    /// Create a pending refund if the payment still has that much left
    pub async fn create_refund(
        &self,
        merchant: &Merchant,
        payment_id: &str,
        request: CreateRefundRequest,
    ) -> AppResult<Refund> {
        let payment = self.get_payment(merchant, payment_id).await?;

        let Some(amount) = request.amount else {
            return Err(AppError::missing_fields());
        };
        if amount <= 0 {
            return Err(AppError::invalid_amount("must be greater than zero"));
        }
        if payment.status != PaymentStatus::Success {
            return Err(AppError::conflict(ConflictError::PaymentNotSuccessful));
        }

        let creation = self
            .refunds
            .create_within_limit(
                NewRefund {
                    id: generate_id(REFUND_ID_PREFIX),
                    payment_id: payment.id.clone(),
                    merchant_id: merchant.id,
                    amount,
                    reason: required(request.reason),
                },
                payment.amount,
            )
            .await?;

        let refund = match creation {
            RefundCreation::Created(refund) => refund,
            RefundCreation::ExceedsAvailable { available } => {
                return Err(AppError::conflict(ConflictError::RefundExceedsAvailable {
                    requested: amount,
                    available,
                }));
            }
        };

        self.queues
            .dispatch(JobPayload::process_refund(refund.id.clone()), Duration::ZERO)
            .await?;

        info!(
            refund_id = %refund.id,
            payment_id = %payment.id,
            amount = refund.amount,
            "refund created"
        );
        Ok(refund)
    }

    pub async fn get_refund(&self, merchant: &Merchant, refund_id: &str) -> AppResult<Refund> {
        self.refunds
            .find_by_id(refund_id)
            .await?
            .filter(|r| r.merchant_id == merchant.id)
            .ok_or_else(|| AppError::not_found("Refund"))
    }
}
