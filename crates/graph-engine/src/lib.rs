//! 规则图解释器
//!
//! 奖励核心的心脏：把管理面发布的工作流图（DAG）解释执行为积分/等级
//! 效果。图以 JSON 存储，加载时编译为强类型 AST 并缓存；执行前先过
//! 幂等账本，终端效果与账本写入在同一数据库事务内提交。
//!
//! 两种执行模式：
//! - 事件模式：一条入站触发器，对绑定该事件类型的全部活跃规则逐条求值；
//! - 受众模式：定时 tick 驱动，受众选择节点给出匹配用户集，逐用户独立求值。

pub mod compiler;
pub mod context;
pub mod error;
pub mod interpreter;
pub mod model;
pub mod nodes;
pub mod profile;
pub mod store;
