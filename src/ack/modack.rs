//! Deadline extension batches.

use crate::ack::AckRequestData;

/// A group of ack requests that share one deadline extension.
///
/// A nack is a modack with zero seconds. Receipt modacks are the initial lease sent when
/// a message arrives; they are not user triggered.
#[derive(Debug, Clone)]
pub struct ModackRequestData {
    deadline_extension_seconds: i32,
    ack_requests: Vec<AckRequestData>,
    is_receipt_modack: bool,
}

impl ModackRequestData {
    /// Create an empty batch.
    pub fn new(deadline_extension_seconds: i32) -> Self {
        Self::with_requests(deadline_extension_seconds, Vec::new())
    }

    /// Create a batch with the given members.
    pub fn with_requests(deadline_extension_seconds: i32, ack_requests: Vec<AckRequestData>) -> Self {
        Self {
            deadline_extension_seconds,
            ack_requests,
            is_receipt_modack: false,
        }
    }

    /// Mark this batch as a receipt modack.
    pub fn receipt(mut self) -> Self {
        self.is_receipt_modack = true;
        self
    }

    /// Extension in seconds applied to every member.
    pub fn deadline_extension_seconds(&self) -> i32 {
        self.deadline_extension_seconds
    }

    /// Members in insertion order.
    pub fn ack_requests(&self) -> &[AckRequestData] {
        &self.ack_requests
    }

    /// Take ownership of the members.
    pub fn into_ack_requests(self) -> Vec<AckRequestData> {
        self.ack_requests
    }

    /// Whether this is a receipt modack.
    pub fn is_receipt_modack(&self) -> bool {
        self.is_receipt_modack
    }

    /// Whether this batch is a nack.
    pub fn is_nack(&self) -> bool {
        self.deadline_extension_seconds == 0
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.ack_requests.len()
    }

    /// Whether the batch has no members.
    pub fn is_empty(&self) -> bool {
        self.ack_requests.is_empty()
    }

    /// Append a member.
    pub fn add_ack_request(&mut self, request: AckRequestData) -> &mut Self {
        self.ack_requests.push(request);
        self
    }

    /// Append several members.
    pub fn add_all_ack_requests(&mut self, requests: impl IntoIterator<Item = AckRequestData>) -> &mut Self {
        self.ack_requests.extend(requests);
        self
    }

    /// Split into consecutive batches of at most `batch_size` members.
    ///
    /// Each chunk keeps the extension and the receipt flag. An empty batch yields no
    /// chunks.
    pub fn partition_by_ack_id(&self, batch_size: usize) -> Vec<ModackRequestData> {
        self.ack_requests
            .chunks(batch_size.max(1))
            .map(|chunk| ModackRequestData {
                deadline_extension_seconds: self.deadline_extension_seconds,
                ack_requests: chunk.to_vec(),
                is_receipt_modack: self.is_receipt_modack,
            })
            .collect()
    }

    /// Partition every batch of `batches` and flatten the result.
    pub fn partition_all(batches: &[ModackRequestData], batch_size: usize) -> Vec<ModackRequestData> {
        batches
            .iter()
            .flat_map(|batch| batch.partition_by_ack_id(batch_size))
            .collect()
    }
}
