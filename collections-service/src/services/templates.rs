//! HTML bodies and subjects for client emails.

use crate::models::{round_cents, Invoice, StaffingRequest};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

pub fn default_subject(request_id: Uuid) -> String {
    format!("Request #{} from Evershift", request_id)
}

pub fn follow_up_subject(request_id: Uuid) -> String {
    format!("Follow-up: Outstanding Invoice #{} from Evershift", request_id)
}

/// `$1,234.50`
pub fn format_currency(amount: Decimal) -> String {
    let rounded = round_cents(amount);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let text = format!("{:.2}", rounded.abs());
    let (whole, cents) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    format!("{}${}.{}", if negative { "-" } else { "" }, grouped, cents)
}

pub fn format_date(date: DateTime<Utc>) -> String {
    date.format("%B %-d, %Y").to_string()
}

pub fn payment_button(payment_url: &str, balance: Decimal) -> String {
    format!(
        r#"<div style="margin: 24px 0; text-align: center;">
  <a href="{url}" style="display: inline-block; background-color: #0070f3; color: #ffffff; padding: 14px 28px; text-decoration: none; border-radius: 6px; font-weight: bold;">Pay Invoice - {balance}</a>
  <p style="margin-top: 8px; font-size: 12px; color: #6b7280;">Secure payment powered by Stripe</p>
</div>"#,
        url = payment_url,
        balance = format_currency(balance),
    )
}

/// Wrap operator-written content, appending a payment button when a URL is given.
pub fn wrap_content(content: &str, payment_url: Option<&str>, balance: Decimal) -> String {
    let button = payment_url
        .map(|url| payment_button(url, balance))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">{content}</div>
  {button}
</body>
</html>"#,
    )
}

/// Reminder for an overdue invoice.
pub fn follow_up_html(
    invoice: &Invoice,
    request: &StaffingRequest,
    payment_url: Option<&str>,
    now: DateTime<Utc>,
) -> String {
    let days_past_due = (now - invoice.due_date).num_days().max(0);
    let button = payment_url
        .map(|url| payment_button(url, invoice.balance))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <h1 style="text-align: center;">Payment Reminder</h1>
    <p style="text-align: center;">Invoice #{request_id}</p>
    <h2>Hi {name},</h2>
    <p>Your invoice became due {days} days ago and still shows an outstanding balance.</p>
    <p style="font-size: 20px; font-weight: bold; text-align: center;">Outstanding Balance: {balance}</p>
    {button}
    <h3>Invoice Summary</h3>
    <p><strong>Invoice Number:</strong> #{request_id}</p>
    <p><strong>PO Number:</strong> {po_number}</p>
    <p><strong>Due Date:</strong> {due_date}</p>
    <p><strong>Days Past Due:</strong> {days}</p>
    <p><strong>Amount:</strong> {amount}</p>
    <p>Questions about this invoice? Reply to this email and our team will help.</p>
    <p><strong>The Evershift Team</strong></p>
  </div>
</body>
</html>"#,
        request_id = invoice.request_id,
        name = request.client_name(),
        days = days_past_due,
        balance = format_currency(invoice.balance),
        po_number = invoice.po_number,
        due_date = format_date(invoice.due_date),
        amount = format_currency(invoice.amount),
        button = button,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceBreakdown;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_format_currency() {
        assert_eq!(format_currency(Decimal::new(87458, 2)), "$874.58");
        assert_eq!(format_currency(Decimal::new(123456789, 2)), "$1,234,567.89");
        assert_eq!(format_currency(Decimal::new(1000, 0)), "$1,000.00");
        assert_eq!(format_currency(Decimal::ZERO), "$0.00");
        assert_eq!(format_currency(Decimal::new(-505, 1)), "-$50.50");
    }

    #[test]
    fn test_subjects() {
        let id = Uuid::nil();
        assert_eq!(
            default_subject(id),
            "Request #00000000-0000-0000-0000-000000000000 from Evershift"
        );
        assert!(follow_up_subject(id).starts_with("Follow-up: Outstanding Invoice #"));
    }

    #[test]
    fn test_follow_up_html_includes_button_only_with_url() {
        let now = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap();
        let request = StaffingRequest {
            request_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            event_location: None,
            start_date: now - Duration::days(10),
            created_utc: now,
        };
        let breakdown = PriceBreakdown {
            subtotal: Decimal::new(100, 0),
            transaction_fee: Decimal::ZERO,
            service_fee: Decimal::ZERO,
            total: Decimal::new(100, 0),
        };
        let invoice = Invoice::for_request(&request, &breakdown, None, now);

        let html = follow_up_html(&invoice, &request, Some("https://pay.test/x"), now);
        assert!(html.contains("Hi Ada Lovelace"));
        assert!(html.contains("10 days ago"));
        assert!(html.contains("Pay Invoice - $100.00"));

        let html = follow_up_html(&invoice, &request, None, now);
        assert!(!html.contains("Pay Invoice"));
    }
}
