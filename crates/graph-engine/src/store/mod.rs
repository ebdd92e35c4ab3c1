//! 存储层
//!
//! trait 抽象 + PostgreSQL 实现。解释器只依赖 trait，
//! 单测中以内存替身注入；正确性关键的唯一约束（幂等账本、
//! 执行计数上限）由数据库层保证，应用代码不做独立判断。

pub mod effect_writer;
pub mod ledger_repo;
pub mod node_state_repo;
pub mod outbox_repo;
pub mod profile_repo;
pub mod rule_repo;
pub mod traits;

pub use effect_writer::PgEffectWriter;
pub use node_state_repo::PgNodeStateStore;
pub use profile_repo::PgProfileStore;
pub use rule_repo::PgRuleSource;
pub use traits::{ApplyOutcome, AudienceSource, EffectWriter, ExecutionKey, NodeStateStore, RuleSource};
