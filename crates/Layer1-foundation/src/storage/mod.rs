//! Storage module for Tandem
//!
//! - `kv`: 키-값 레코드 저장 계약 (CAS 지원) + 인메모리 구현
//! - `sqlite`: SQLite 기반 영속 키-값 저장소
//! - `json`: JSON - 설정 파일 저장/로드

pub mod kv;
mod json;
mod sqlite;

pub use json::{ConfigScope, JsonStore};
pub use kv::{cas_json, keys, load_json, put_json, scan_json, KvStore, MemoryKvStore, Versioned};
pub use sqlite::{SqliteKvStore, STORE_FILE};
