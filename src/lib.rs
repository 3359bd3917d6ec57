//! Hybrid OCR - document text extraction with two engines
//!
//! Preprocesses a document image, runs a neural and a classical OCR engine
//! side by side, keeps the more confident transcription and corrects it
//! against a dictionary.

pub mod capture;
pub mod config;
pub mod errors;
pub mod export;
pub mod storage;
pub mod vision;
