use crate::backend::BackendError;
use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("no room for {size} bytes in memory type {memory_type_index}")]
    Exhausted { size: u64, memory_type_index: u32 },

    #[error("heap {heap_index} is over budget: {requested} bytes requested, {available} bytes left")]
    BudgetExceeded {
        heap_index: u32,
        requested: u64,
        available: u64,
    },

    #[error("no memory type in {memory_type_bits:#b} has the required flags {required:?}")]
    NoCompatibleMemoryType {
        memory_type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    #[error("allocation '{name}' is not host visible")]
    NotHostVisible { name: String },

    #[error("range {offset}..{end} is out of bounds for allocation '{name}' of {size} bytes")]
    OutOfBounds {
        name: String,
        offset: u64,
        end: u64,
        size: u64,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl MemoryError {
    /// Exhaustion and budget errors can be retried after freeing memory.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            MemoryError::Exhausted { .. } | MemoryError::BudgetExceeded { .. }
        )
    }
}
