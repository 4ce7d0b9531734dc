//! 配置模块，负责加载 schema 与表映射的 JSON 配置文件
//!
//! ```json
//! {
//!   "types": [
//!     { "name": "Book", "properties": [
//!         { "name": "Id", "type": "int", "unique": true },
//!         { "name": "Shelf", "type": { "object": "Address" } }
//!     ] }
//!   ],
//!   "tables": { "Book": "books" }
//! }
//! ```

use crate::schema::{PropertyDef, PropertyType, Schema, TypeDef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
#[error("配置错误: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

/// Schema 与表映射配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// 可查询的实体类型及其属性
    pub types: Vec<TypeDef>,
    /// 实体名到数据库表名的映射
    #[serde(default)]
    pub tables: HashMap<String, String>,
}

impl SchemaConfig {
    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        // 检查文件是否存在
        if !path_ref.exists() {
            return Err(ConfigError::new(format!("配置文件不存在: {}", path_ref.display())));
        }

        // 读取文件内容
        let content = fs::read_to_string(path_ref)
            .map_err(|e| ConfigError::new(format!("无法读取配置文件 {}: {}", path_ref.display(), e)))?;

        Self::from_json_str(&content)
            .map_err(|e| ConfigError::new(format!("{} ({})", e.message, path_ref.display())))
    }

    /// 从JSON字符串解析配置，并校验类型引用
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: SchemaConfig = serde_json::from_str(content)
            .map_err(|e| ConfigError::new(format!("无法解析JSON配置: {}", e)))?;
        config.schema()?;
        Ok(config)
    }

    /// 构建并校验 schema
    pub fn schema(&self) -> Result<Schema, ConfigError> {
        let mut schema = Schema::new();
        for def in &self.types {
            schema.insert(def.clone());
        }
        schema.validate().map_err(ConfigError::new)?;
        Ok(schema)
    }

    /// 获取实体对应的表名，如果不存在则返回小写的实体名
    pub fn table_name(&self, entity: &str) -> String {
        self.tables
            .get(entity)
            .cloned()
            .unwrap_or_else(|| entity.to_lowercase())
    }

    /// 获取所有表映射
    pub fn tables(&self) -> &HashMap<String, String> {
        &self.tables
    }

    /// 创建默认配置（用于演示或fallback）
    pub fn default() -> Self {
        let types = vec![
            TypeDef::new("Book")
                .property(PropertyDef::new("Id", PropertyType::Int).unique())
                .property(PropertyDef::new("Author", PropertyType::String))
                .property(PropertyDef::new("Title", PropertyType::String))
                .property(PropertyDef::new("ISBN", PropertyType::String).unique())
                .property(PropertyDef::new("LastUpdated", PropertyType::DateTime))
                .property(PropertyDef::new("IsAvailable", PropertyType::Bool))
                .property(PropertyDef::new("Tags", PropertyType::List(Box::new(PropertyType::String))))
                .property(PropertyDef::new("Shelf", PropertyType::Object("Address".to_string())))
                .property(PropertyDef::new("Notes", PropertyType::String).ignored()),
            TypeDef::new("Library")
                .renamed("ext_library")
                .property(PropertyDef::new("Id", PropertyType::Int).renamed("lb_Id").unique())
                .property(PropertyDef::new("Name", PropertyType::String))
                .property(PropertyDef::new("Address", PropertyType::Object("Address".to_string()))),
            TypeDef::new("Author")
                .property(PropertyDef::new("Id", PropertyType::Int).unique())
                .property(PropertyDef::new("Name", PropertyType::String))
                .property(PropertyDef::new("Born", PropertyType::DateTime)),
            TypeDef::new("Address")
                .property(PropertyDef::new("City", PropertyType::String))
                .property(PropertyDef::new("Street", PropertyType::String))
                .property(PropertyDef::new("Geo", PropertyType::Object("Geo".to_string()))),
            TypeDef::new("Geo")
                .property(PropertyDef::new("Lat", PropertyType::Float))
                .property(PropertyDef::new("Lon", PropertyType::Float)),
        ];

        let mut tables = HashMap::new();
        tables.insert("Book".to_string(), "books".to_string());
        tables.insert("Library".to_string(), "libraries".to_string());
        tables.insert("Author".to_string(), "authors".to_string());

        Self { types, tables }
    }
}
