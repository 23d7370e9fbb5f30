use serde_json::{json, Value};

use cross_cloud_types::Primitive;

use crate::scope::MemoryScope;

/// A structured description of one mutating memory operation, published
/// on the scope's topic when the caller asked for change notification.
/// No message is produced for no-op mutations.
#[derive(Debug, Clone)]
pub enum MemoryChange {
    SetKeyValue { values: Vec<(String, Primitive)> },
    DeleteKey { key: String },
    DeleteAllKeys,
    PushToListHead { list: String, values: Vec<Primitive> },
    PushToListTail { list: String, values: Vec<Primitive> },
    PushToListTailIfNotExists { list: String, values: Vec<Primitive> },
    PopFirstElementOfList { list: String, value: Primitive },
    PopLastElementOfList { list: String, value: Primitive },
    RemoveElementsFromList { list: String, values: Vec<Primitive> },
    EmptyList { list: String },
    EmptyListAndSublists { prefix: String },
}

impl MemoryChange {
    pub fn operation(&self) -> &'static str {
        match self {
            MemoryChange::SetKeyValue { .. } => "SetKeyValue",
            MemoryChange::DeleteKey { .. } => "DeleteKey",
            MemoryChange::DeleteAllKeys => "DeleteAllKeys",
            MemoryChange::PushToListHead { .. } => "PushToListHead",
            MemoryChange::PushToListTail { .. } => "PushToListTail",
            MemoryChange::PushToListTailIfNotExists { .. } => "PushToListTailIfNotExists",
            MemoryChange::PopFirstElementOfList { .. } => "PopFirstElementOfList",
            MemoryChange::PopLastElementOfList { .. } => "PopLastElementOfList",
            MemoryChange::RemoveElementsFromList { .. } => "RemoveElementsFromList",
            MemoryChange::EmptyList { .. } => "EmptyList",
            MemoryChange::EmptyListAndSublists { .. } => "EmptyListAndSublists",
        }
    }

    /// to_message renders the notification payload: the operation kind,
    /// the scope, and the affected keys and values.
    pub fn to_message(&self, scope: &MemoryScope) -> String {
        let mut body = json!({
            "operation": self.operation(),
            "scope": scope.compiled(),
        });
        let object = body.as_object_mut().unwrap();
        match self {
            MemoryChange::SetKeyValue { values } => {
                object.insert(
                    "keys".to_string(),
                    Value::Array(values.iter().map(|(k, _)| json!(k)).collect()),
                );
                object.insert(
                    "values".to_string(),
                    Value::Object(
                        values
                            .iter()
                            .map(|(k, v)| (k.clone(), v.to_json()))
                            .collect(),
                    ),
                );
            }
            MemoryChange::DeleteKey { key } => {
                object.insert("key".to_string(), json!(key));
            }
            MemoryChange::DeleteAllKeys => {}
            MemoryChange::PushToListHead { list, values }
            | MemoryChange::PushToListTail { list, values }
            | MemoryChange::PushToListTailIfNotExists { list, values }
            | MemoryChange::RemoveElementsFromList { list, values } => {
                object.insert("list".to_string(), json!(list));
                object.insert(
                    "values".to_string(),
                    Value::Array(values.iter().map(|v| v.to_json()).collect()),
                );
            }
            MemoryChange::PopFirstElementOfList { list, value }
            | MemoryChange::PopLastElementOfList { list, value } => {
                object.insert("list".to_string(), json!(list));
                object.insert("value".to_string(), value.to_json());
            }
            MemoryChange::EmptyList { list } => {
                object.insert("list".to_string(), json!(list));
            }
            MemoryChange::EmptyListAndSublists { prefix } => {
                object.insert("list".to_string(), json!(prefix));
            }
        }
        body.to_string()
    }
}
