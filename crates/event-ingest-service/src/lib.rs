//! 入站事件处理服务
//!
//! 从 Schema 注册中心动态发现要消费的 topic 集合，把任意生产方的
//! JSON 信封映射为规范化触发器，交给规则图解释器执行，
//! 并为每条原始消息维护入站审计行。位点在消息完整处理后才提交。

pub mod audit;
pub mod error;
pub mod mapper;
pub mod pipeline;
pub mod subscription;
