//! Volatile repository for tests and dry runs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{RegistryError, Result};
use crate::model::record::{validate_fields, validate_number};
use crate::model::{Attachment, DedupKey, IncomingRecord, NewRecord, RecordUpdate};

use super::{sort_for_listing, RecordFilter, Repository};

#[derive(Debug, Default)]
pub struct MemoryRepository {
    records: BTreeMap<i64, IncomingRecord>,
    attachments: BTreeMap<i64, (Attachment, Vec<u8>)>,
    next_id: i64,
    next_attachment_id: i64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in creation order.
    pub fn records(&self) -> Vec<&IncomingRecord> {
        self.records.values().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_number_free(&self, number: i64, except: Option<i64>) -> Result<()> {
        validate_number(number)?;
        match self.records.values().find(|r| r.number == number) {
            Some(r) if Some(r.id) != except => Err(RegistryError::Validation(format!(
                "number {number} is already used"
            ))),
            _ => Ok(()),
        }
    }

    fn attachment_count(&self, record_id: i64) -> usize {
        self.attachments
            .values()
            .filter(|(a, _)| a.record_id == record_id)
            .count()
    }
}

impl Repository for MemoryRepository {
    fn find_by_key(&self, key: DedupKey<'_>) -> Result<Option<IncomingRecord>> {
        Ok(self
            .records
            .values()
            .find(|r| r.dedup_key() == key)
            .cloned())
    }

    fn next_number(&self) -> Result<i64> {
        Ok(self.records.values().map(|r| r.number).max().unwrap_or(0) + 1)
    }

    fn create(&mut self, record: NewRecord) -> Result<IncomingRecord> {
        record.validate()?;
        let number = match record.number {
            Some(n) => {
                self.check_number_free(n, None)?;
                n
            }
            None => self.next_number()?,
        };
        self.next_id += 1;
        let created = IncomingRecord {
            id: self.next_id,
            number,
            date: record.date,
            applicant: record.applicant,
            summary: record.summary,
            responsible: record.responsible,
            deadline: record.deadline,
        };
        self.records.insert(created.id, created.clone());
        Ok(created)
    }

    fn add_attachment(
        &mut self,
        record_id: i64,
        filename: &str,
        content: &[u8],
    ) -> Result<Attachment> {
        self.get(record_id)?;
        self.next_attachment_id += 1;
        let attachment = Attachment {
            id: self.next_attachment_id,
            record_id,
            filename: filename.to_string(),
            stored_path: PathBuf::from(format!("memory/{}", self.next_attachment_id)),
            size: content.len() as u64,
        };
        self.attachments
            .insert(attachment.id, (attachment.clone(), content.to_vec()));
        Ok(attachment)
    }

    fn get(&self, id: i64) -> Result<IncomingRecord> {
        self.records
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("record id {id}")))
    }

    fn get_by_number(&self, number: i64) -> Result<IncomingRecord> {
        self.records
            .values()
            .find(|r| r.number == number)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("record No. {number}")))
    }

    fn list(&self, filter: &RecordFilter) -> Result<Vec<IncomingRecord>> {
        let mut records: Vec<IncomingRecord> = self
            .records
            .values()
            .filter(|r| filter.matches(r, self.attachment_count(r.id)))
            .cloned()
            .collect();
        sort_for_listing(&mut records);
        Ok(records)
    }

    fn update(&mut self, id: i64, update: &RecordUpdate) -> Result<IncomingRecord> {
        let mut record = self.get(id)?;
        if let Some(n) = update.number {
            self.check_number_free(n, Some(id))?;
        }
        update.apply(&mut record);
        validate_fields(&record.applicant, &record.summary, &record.responsible)?;
        self.records.insert(id, record.clone());
        Ok(record)
    }

    fn delete(&mut self, id: i64) -> Result<()> {
        if self.records.remove(&id).is_none() {
            return Err(RegistryError::NotFound(format!("record id {id}")));
        }
        self.attachments.retain(|_, (a, _)| a.record_id != id);
        Ok(())
    }

    fn attachments(&self, record_id: i64) -> Result<Vec<Attachment>> {
        Ok(self
            .attachments
            .values()
            .filter(|(a, _)| a.record_id == record_id)
            .map(|(a, _)| a.clone())
            .collect())
    }

    fn attachment_content(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        self.attachments
            .get(&attachment.id)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| RegistryError::NotFound(format!("attachment id {}", attachment.id)))
    }
}
