//! 模板解析与渲染

pub mod engine;

pub use engine::TemplateEngine;
