// Debug info of a simulated process

use super::image::Image;
use crate::backend::SymbolTable;
use crate::types::{Function, LineEntry};
use std::sync::Arc;

/// Snapshot of an image's debug info.
pub struct SimSymbols {
    image: Arc<Image>,
}

impl SimSymbols {
    pub fn new(image: Arc<Image>) -> Self {
        Self { image }
    }
}

impl SymbolTable for SimSymbols {
    fn functions(&self) -> Vec<Function> {
        self.image
            .functions
            .iter()
            .map(|f| f.function.clone())
            .collect()
    }

    fn line_table(&self, function: &Function) -> Vec<LineEntry> {
        self.image
            .function(&function.name)
            .map(|f| f.lines.clone())
            .unwrap_or_default()
    }

    fn sources(&self) -> Vec<String> {
        self.image.sources()
    }

    fn types(&self) -> Vec<String> {
        self.image.types()
    }

    fn callees(&self, function: &str) -> Vec<String> {
        self.image.callees(function)
    }

    fn function_at(&self, pc: u64) -> Option<Function> {
        self.image.function_at(pc).map(|f| f.function.clone())
    }

    fn line_at(&self, pc: u64) -> Option<LineEntry> {
        self.image.line_at(pc).cloned()
    }
}
