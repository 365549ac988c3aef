//! Demo invoice jobs.
//!
//! Every job writes its artifacts under one output directory, so a run can be
//! inspected afterwards without a database.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use relay_core::typed::RegistryError;
use relay_core::{EngineBuilder, Handler, Job, JobContext, JobError, Priority};

pub const INVOICE_QUEUE: &str = "invoices";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

impl LineItem {
    fn new(description: &str, quantity: u32, unit_price_cents: u64) -> Self {
        Self {
            description: description.to_string(),
            quantity,
            unit_price_cents,
        }
    }

    pub fn total_cents(&self) -> u64 {
        u64::from(self.quantity) * self.unit_price_cents
    }
}

/// Result of `generate_invoice`, consumed by every later step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: u64,
    pub number: String,
    pub customer_id: u64,
    pub customer_email: Option<String>,
    pub items: Vec<LineItem>,
    pub total_cents: u64,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
}

fn default_due_days() -> i64 {
    30
}

fn default_email_status() -> String {
    "sent".to_string()
}

fn default_communication_type() -> String {
    "email".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateInvoice {
    pub invoice_id: u64,
    pub customer_id: u64,
    #[serde(default)]
    pub items: Vec<LineItem>,
    #[serde(default = "default_due_days")]
    pub due_days: i64,
}

impl Job for GenerateInvoice {
    const NAME: &'static str = "generate_invoice";
    const QUEUE: &'static str = INVOICE_QUEUE;
    const PRIORITY: Priority = Priority::High;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateInvoiceData {
    pub invoice_id: u64,
}

impl Job for ValidateInvoiceData {
    const NAME: &'static str = "validate_invoice_data";
    const QUEUE: &'static str = INVOICE_QUEUE;
    const PRIORITY: Priority = Priority::High;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateInvoicePdf {
    pub invoice_id: u64,
}

impl Job for GenerateInvoicePdf {
    const NAME: &'static str = "generate_invoice_pdf";
    const QUEUE: &'static str = INVOICE_QUEUE;
    const PRIORITY: Priority = Priority::High;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEmailActivity {
    pub invoice_id: u64,
    #[serde(default)]
    pub recipient_email: Option<String>,
    #[serde(default = "default_email_status")]
    pub status: String,
}

impl Job for LogEmailActivity {
    const NAME: &'static str = "log_email_activity";
    const QUEUE: &'static str = INVOICE_QUEUE;
    const PRIORITY: Priority = Priority::Low;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCommunicationHistory {
    pub invoice_id: u64,
    #[serde(default = "default_communication_type")]
    pub communication_type: String,
}

impl Job for UpdateCommunicationHistory {
    const NAME: &'static str = "update_customer_communication_history";
    const QUEUE: &'static str = INVOICE_QUEUE;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendInvoiceEmail {
    pub invoice_id: u64,
}

impl Job for SendInvoiceEmail {
    const NAME: &'static str = "send_invoice_email";
    const QUEUE: &'static str = INVOICE_QUEUE;
}

/// Summary of every invoice generated by its dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateDailyReport;

impl Job for GenerateDailyReport {
    const NAME: &'static str = "generate_daily_invoice_report";
}

pub const JOB_NAMES: &[&str] = &[
    GenerateInvoice::NAME,
    ValidateInvoiceData::NAME,
    GenerateInvoicePdf::NAME,
    LogEmailActivity::NAME,
    UpdateCommunicationHistory::NAME,
    SendInvoiceEmail::NAME,
    GenerateDailyReport::NAME,
];

/// Shared state of the invoice job bodies.
#[derive(Clone)]
pub struct InvoiceDesk {
    out: Arc<PathBuf>,

    /// Serializes read-modify-write of customer history files.
    history: Arc<Mutex<()>>,

    /// PDF renders left to fail on purpose.
    pdf_failures: Arc<AtomicU32>,
}

impl InvoiceDesk {
    pub fn new(out: impl Into<PathBuf>, pdf_failures: u32) -> Self {
        Self {
            out: Arc::new(out.into()),
            history: Arc::new(Mutex::new(())),
            pdf_failures: Arc::new(AtomicU32::new(pdf_failures)),
        }
    }

    /// Register every invoice job on `builder`.
    pub fn register(&self, builder: EngineBuilder) -> Result<EngineBuilder, RegistryError> {
        builder
            .register::<GenerateInvoice, _>(self.clone())?
            .register::<ValidateInvoiceData, _>(self.clone())?
            .register::<GenerateInvoicePdf, _>(self.clone())?
            .register::<LogEmailActivity, _>(self.clone())?
            .register::<UpdateCommunicationHistory, _>(self.clone())?
            .register::<SendInvoiceEmail, _>(self.clone())?
            .register::<GenerateDailyReport, _>(self.clone())
            .map(|b| b.expect_jobs(JOB_NAMES))
    }

    async fn dir(&self, name: &str) -> Result<PathBuf, JobError> {
        let dir = self.out.join(name);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

fn customer_email(customer_id: u64) -> Option<String> {
    Some(format!("customer{customer_id}@example.com"))
}

fn default_items() -> Vec<LineItem> {
    vec![
        LineItem::new("Service fee", 1, 10_000),
        LineItem::new("Consultation", 2, 7_500),
    ]
}

fn cents(amount: u64) -> String {
    format!("{}.{:02}", amount / 100, amount % 100)
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl Handler<GenerateInvoice> for InvoiceDesk {
    type Output = Invoice;

    async fn handle(&self, job: GenerateInvoice, _ctx: JobContext) -> Result<Invoice, JobError> {
        if job.due_days < 0 {
            return Err(JobError::permanent(format!("due_days must not be negative, got {}", job.due_days)));
        }
        let items = if job.items.is_empty() {
            default_items()
        } else {
            job.items
        };
        let issue_date = Utc::now().date_naive();
        let due_date = TimeDelta::try_days(job.due_days)
            .and_then(|term| issue_date.checked_add_signed(term))
            .ok_or_else(|| JobError::permanent(format!("due_days {} is out of range", job.due_days)))?;
        let invoice = Invoice {
            invoice_id: job.invoice_id,
            number: format!("INV-{}-{:04}", issue_date.format("%Y%m%d"), job.invoice_id),
            customer_id: job.customer_id,
            customer_email: customer_email(job.customer_id),
            total_cents: items.iter().map(LineItem::total_cents).sum(),
            items,
            issue_date,
            due_date,
        };

        let path = self
            .dir("invoices")
            .await?
            .join(format!("invoice_{}.json", invoice.invoice_id));
        fs::write(&path, serde_json::to_vec_pretty(&invoice)?).await?;

        info!(invoice = %invoice.number, total = %cents(invoice.total_cents), "invoice generated");
        Ok(invoice)
    }
}

#[async_trait]
impl Handler<ValidateInvoiceData> for InvoiceDesk {
    type Output = bool;

    async fn handle(&self, job: ValidateInvoiceData, ctx: JobContext) -> Result<bool, JobError> {
        let invoice: Invoice = ctx.dependency_result(GenerateInvoice::NAME)?;

        let mut problems = Vec::new();
        if invoice.items.is_empty() {
            problems.push("invoice has no items".to_string());
        }
        if invoice.customer_email.as_deref().is_none_or(str::is_empty) {
            problems.push("customer has no email address".to_string());
        }
        let expected: u64 = invoice.items.iter().map(LineItem::total_cents).sum();
        if expected != invoice.total_cents {
            problems.push(format!(
                "total {} does not match items {}",
                cents(invoice.total_cents),
                cents(expected)
            ));
        }
        if invoice.issue_date > invoice.due_date {
            problems.push("issue date is after due date".to_string());
        }

        if problems.is_empty() {
            Ok(true)
        } else {
            Err(JobError::permanent(format!(
                "invoice {} is invalid: {}",
                job.invoice_id,
                problems.join("; ")
            )))
        }
    }
}

#[async_trait]
impl Handler<GenerateInvoicePdf> for InvoiceDesk {
    type Output = String;

    async fn handle(&self, job: GenerateInvoicePdf, ctx: JobContext) -> Result<String, JobError> {
        let left = self
            .pdf_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if let Ok(left) = left {
            warn!(invoice_id = job.invoice_id, attempt = ctx.attempt, "pdf renderer unavailable");
            return Err(JobError::new(format!("pdf renderer unavailable (failures left={})", left - 1)));
        }

        let invoice: Invoice = ctx.dependency_result(GenerateInvoice::NAME)?;
        let path = self
            .dir("invoice_pdfs")
            .await?
            .join(format!("invoice_{}.pdf", invoice.number.replace('-', "_")));

        let mut body = format!(
            "INVOICE {}\nCustomer: {}\nIssued: {}\nDue: {}\n\n",
            invoice.number, invoice.customer_id, invoice.issue_date, invoice.due_date
        );
        for item in &invoice.items {
            body.push_str(&format!(
                "{} x{} @ {} = {}\n",
                item.description,
                item.quantity,
                cents(item.unit_price_cents),
                cents(item.total_cents())
            ));
        }
        body.push_str(&format!("\nTotal: {}\n", cents(invoice.total_cents)));
        fs::write(&path, body).await?;

        Ok(path_string(&path))
    }
}

#[async_trait]
impl Handler<LogEmailActivity> for InvoiceDesk {
    type Output = bool;

    async fn handle(&self, job: LogEmailActivity, ctx: JobContext) -> Result<bool, JobError> {
        let invoice: Invoice = ctx.dependency_result(GenerateInvoice::NAME)?;
        let entry = serde_json::json!({
            "timestamp": Utc::now(),
            "invoice_id": job.invoice_id,
            "invoice_number": invoice.number,
            "recipient": job.recipient_email.or(invoice.customer_email),
            "status": job.status,
        });

        let path = self.dir("email_logs").await?.join("email_activity.log");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(true)
    }
}

#[async_trait]
impl Handler<UpdateCommunicationHistory> for InvoiceDesk {
    type Output = bool;

    async fn handle(&self, job: UpdateCommunicationHistory, ctx: JobContext) -> Result<bool, JobError> {
        let invoice: Invoice = ctx.dependency_result(GenerateInvoice::NAME)?;
        let path = self
            .dir("customer_communications")
            .await?
            .join(format!("customer_{}.json", invoice.customer_id));

        let _guard = self.history.lock().await;
        let mut history: Vec<serde_json::Value> = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        history.push(serde_json::json!({
            "timestamp": Utc::now(),
            "type": job.communication_type,
            "invoice_id": job.invoice_id,
            "invoice_number": invoice.number,
            "amount": cents(invoice.total_cents),
        }));
        fs::write(&path, serde_json::to_vec_pretty(&history)?).await?;
        Ok(true)
    }
}

#[async_trait]
impl Handler<SendInvoiceEmail> for InvoiceDesk {
    type Output = bool;

    async fn handle(&self, job: SendInvoiceEmail, ctx: JobContext) -> Result<bool, JobError> {
        let invoice: Invoice = ctx.dependency_result(GenerateInvoice::NAME)?;
        let document: String = ctx.dependency_result(GenerateInvoicePdf::NAME)?;
        let recipient = invoice
            .customer_email
            .ok_or_else(|| JobError::permanent(format!("invoice {} has no recipient", job.invoice_id)))?;

        let message = format!(
            "To: {recipient}\nSubject: Invoice {number}\nAttachment: {document}\n\n\
             Please find attached invoice {number} for {total}, due {due}.\n",
            number = invoice.number,
            total = cents(invoice.total_cents),
            due = invoice.due_date,
        );
        let path = self
            .dir("outbox")
            .await?
            .join(format!("invoice_{}.eml", invoice.invoice_id));
        fs::write(&path, message).await?;

        info!(invoice = %invoice.number, %recipient, "invoice email sent");
        Ok(true)
    }
}

#[async_trait]
impl Handler<GenerateDailyReport> for InvoiceDesk {
    type Output = String;

    async fn handle(&self, _job: GenerateDailyReport, ctx: JobContext) -> Result<String, JobError> {
        let mut invoices = Vec::new();
        for dep in ctx.dependencies.iter().filter(|d| d.name == GenerateInvoice::NAME) {
            invoices.push(serde_json::from_value::<Invoice>(dep.result.clone())?);
        }
        invoices.sort_by_key(|i| i.invoice_id);

        let today = Utc::now().date_naive();
        let mut body = format!("Daily invoice report {today}\n\n");
        for invoice in &invoices {
            body.push_str(&format!(
                "{}  customer {}  {}\n",
                invoice.number,
                invoice.customer_id,
                cents(invoice.total_cents)
            ));
        }
        let total: u64 = invoices.iter().map(|i| i.total_cents).sum();
        body.push_str(&format!("\n{} invoices, {} total\n", invoices.len(), cents(total)));

        let path = self
            .dir("invoice_reports")
            .await?
            .join(format!("daily_invoice_report_{}.txt", today.format("%Y%m%d")));
        fs::write(&path, body).await?;
        Ok(path_string(&path))
    }
}
