//! Untyped protobuf configuration with a stable encoding.
//!
//! `google.protobuf.Struct` is generated with a `HashMap`, so its bytes follow
//! hash iteration order and change between builds. The messages here share
//! the wire format of `Struct`, `Value`, `ListValue` and
//! `xds.type.v3.TypedStruct` but keep fields in a `BTreeMap`, which prost
//! encodes in key order. Envoy decodes them as the upstream types.

use std::collections::BTreeMap;

use envoy_types::pb::google::protobuf::Any;

use crate::xds::envoy::to_any;

pub const TYPED_STRUCT_TYPE_URL: &str = "type.googleapis.com/xds.type.v3.TypedStruct";

/// `google.protobuf.Struct` with ordered fields.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderedStruct {
    #[prost(btree_map = "string, message", tag = "1")]
    pub fields: BTreeMap<String, OrderedValue>,
}

/// `google.protobuf.Value` without the null variant.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderedValue {
    #[prost(oneof = "ValueKind", tags = "2, 3, 4, 5, 6")]
    pub kind: Option<ValueKind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum ValueKind {
    #[prost(double, tag = "2")]
    Number(f64),
    #[prost(string, tag = "3")]
    String(String),
    #[prost(bool, tag = "4")]
    Bool(bool),
    #[prost(message, tag = "5")]
    Struct(OrderedStruct),
    #[prost(message, tag = "6")]
    List(OrderedList),
}

/// `google.protobuf.ListValue`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderedList {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<OrderedValue>,
}

/// `xds.type.v3.TypedStruct`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TypedStruct {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(message, optional, tag = "2")]
    pub value: Option<OrderedStruct>,
}

impl OrderedStruct {
    pub fn from_fields(fields: Vec<(&str, OrderedValue)>) -> Self {
        Self { fields: fields.into_iter().map(|(key, value)| (key.to_string(), value)).collect() }
    }
}

/// Wrap an untyped configuration for an extension Envoy only knows by name.
pub fn typed_struct(type_url: &str, fields: Vec<(&str, OrderedValue)>) -> Any {
    let typed = TypedStruct {
        type_url: type_url.to_string(),
        value: Some(OrderedStruct::from_fields(fields)),
    };
    to_any(TYPED_STRUCT_TYPE_URL, &typed)
}

pub fn string_value(value: impl Into<String>) -> OrderedValue {
    OrderedValue { kind: Some(ValueKind::String(value.into())) }
}

pub fn number_value(value: f64) -> OrderedValue {
    OrderedValue { kind: Some(ValueKind::Number(value)) }
}

pub fn list_value(values: Vec<OrderedValue>) -> OrderedValue {
    OrderedValue { kind: Some(ValueKind::List(OrderedList { values })) }
}

pub fn struct_value(fields: Vec<(&str, OrderedValue)>) -> OrderedValue {
    OrderedValue { kind: Some(ValueKind::Struct(OrderedStruct::from_fields(fields))) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::google::protobuf::{value::Kind, Struct};
    use prost::Message;

    fn sample() -> OrderedStruct {
        OrderedStruct::from_fields(vec![
            ("zeta", string_value("last")),
            ("alpha", number_value(1.0)),
            ("nested", struct_value(vec![("b", string_value("2")), ("a", string_value("1"))])),
            ("list", list_value(vec![string_value("x"), number_value(2.0)])),
        ])
    }

    #[test]
    fn decodes_as_protobuf_struct() {
        let decoded = Struct::decode(sample().encode_to_vec().as_slice()).expect("decode struct");
        assert_eq!(decoded.fields.len(), 4);
        assert_eq!(
            decoded.fields.get("zeta").and_then(|v| v.kind.clone()),
            Some(Kind::StringValue("last".to_string()))
        );
        let Some(Kind::StructValue(nested)) = decoded.fields.get("nested").and_then(|v| v.kind.clone())
        else {
            panic!("expected nested struct");
        };
        assert_eq!(nested.fields.len(), 2);
        let Some(Kind::ListValue(list)) = decoded.fields.get("list").and_then(|v| v.kind.clone()) else {
            panic!("expected list");
        };
        assert_eq!(list.values.len(), 2);
    }

    #[test]
    fn encoding_ignores_insertion_order() {
        let reversed = OrderedStruct::from_fields(vec![
            ("list", list_value(vec![string_value("x"), number_value(2.0)])),
            ("nested", struct_value(vec![("a", string_value("1")), ("b", string_value("2"))])),
            ("alpha", number_value(1.0)),
            ("zeta", string_value("last")),
        ]);
        assert_eq!(sample().encode_to_vec(), reversed.encode_to_vec());
    }

    #[test]
    fn typed_struct_carries_type_url() {
        let any = typed_struct("example.Config", vec![("path", string_value("/healthz"))]);
        assert_eq!(any.type_url, TYPED_STRUCT_TYPE_URL);
        let decoded = TypedStruct::decode(any.value.as_slice()).expect("decode typed struct");
        assert_eq!(decoded.type_url, "example.Config");
        assert_eq!(decoded.value.map(|v| v.fields.len()), Some(1));
    }
}
