//! 能力描述符：名称、描述（供 LLM 与关键词打分）、输入结构、输出种类
//!
//! 输入结构按字段描述类型 / 是否必填 / 默认值；normalize 负责补默认值、
//! 做宽松类型转换（"5" -> 5），并丢弃未声明的字段。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// 字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
}

impl FieldType {
    fn json_name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
        }
    }
}

/// 能力产出值的语义种类；「上一步结果」占位符据此绑定到最近的同类产出步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Text,
    Location,
    Weather,
    Distance,
    Links,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: String,
    /// 该字段可接收的上游产出种类
    pub accepts: Option<ValueKind>,
}

impl FieldSpec {
    pub fn required(field_type: FieldType, description: impl Into<String>) -> Self {
        Self {
            field_type,
            required: true,
            default: None,
            description: description.into(),
            accepts: None,
        }
    }

    pub fn optional(field_type: FieldType, default: Value, description: impl Into<String>) -> Self {
        Self {
            field_type,
            required: false,
            default: Some(default),
            description: description.into(),
            accepts: None,
        }
    }

    pub fn accepts(mut self, kind: ValueKind) -> Self {
        self.accepts = Some(kind);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub input_shape: BTreeMap<String, FieldSpec>,
    pub output_kind: ValueKind,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, output_kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_shape: BTreeMap::new(),
            output_kind,
        }
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.input_shape.insert(name.into(), spec);
        self
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.input_shape
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
    }

    /// 对单个字段做类型转换；未声明字段返回 Err
    pub fn coerce(&self, field: &str, value: &Value) -> Result<Value, String> {
        let spec = self
            .input_shape
            .get(field)
            .ok_or_else(|| format!("{} has no field '{}'", self.name, field))?;
        coerce_value(spec.field_type, value)
            .ok_or_else(|| format!("field '{}' expects {}, got {}", field, spec.field_type.json_name(), value))
    }

    /// 规范化完整参数：丢弃未声明字段、转换类型、补默认值、检查必填
    pub fn normalize(&self, args: &Map<String, Value>) -> Result<Map<String, Value>, String> {
        let mut out = Map::new();
        for (name, spec) in &self.input_shape {
            match args.get(name).filter(|v| !is_blank(v)) {
                Some(v) => {
                    out.insert(name.clone(), self.coerce(name, v)?);
                }
                None => {
                    if let Some(default) = &spec.default {
                        out.insert(name.clone(), default.clone());
                    } else if spec.required {
                        return Err(format!("missing required field '{}'", name));
                    }
                }
            }
        }
        for extra in args.keys().filter(|k| !self.input_shape.contains_key(*k)) {
            tracing::debug!(capability = %self.name, field = %extra, "undeclared argument dropped");
        }
        Ok(out)
    }

    /// JSON Schema 形式的输入结构（拼入规划 prompt）
    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .input_shape
            .iter()
            .map(|(name, spec)| {
                let mut prop = json!({
                    "type": spec.field_type.json_name(),
                    "description": spec.description,
                });
                if let Some(default) = &spec.default {
                    prop["default"] = default.clone();
                }
                (name.clone(), prop)
            })
            .collect();
        let required: Vec<&str> = self.required_fields().collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// null 与空白字符串视为缺失
pub fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn coerce_value(field_type: FieldType, value: &Value) -> Option<Value> {
    match (field_type, value) {
        (FieldType::String, Value::String(s)) => Some(Value::String(s.trim().to_string())),
        (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (FieldType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (FieldType::Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(Value::from),
        (FieldType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        (FieldType::Number, Value::Number(n)) => n.as_f64().map(Value::from),
        (FieldType::Number, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
        (FieldType::Boolean, Value::Bool(b)) => Some(Value::Bool(*b)),
        (FieldType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(Value::Bool(true)),
            "false" | "no" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}
