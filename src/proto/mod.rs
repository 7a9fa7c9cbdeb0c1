//! Wire-format message types for schema definitions.
//!
//! These are hand-rolled `prost` derive messages rather than `protoc` output:
//! the proxy has no RPC surface, it only needs canonical serialized forms.
//! Prost encodes fields in tag order, which makes `encode_to_vec` byte-stable
//! for equal values — the property the snapshot cache key relies on.

pub mod schema {
    /// A namespace definition: the unit of schema addressed by namespace name.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NamespaceDefinition {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "2")]
        pub relations: ::prost::alloc::vec::Vec<Relation>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Relation {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, repeated, tag = "2")]
        pub allowed_subject_types: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }

    /// A caveat definition: a named, parameterized condition expression.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CaveatDefinition {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "2")]
        pub parameters: ::prost::alloc::vec::Vec<CaveatParameter>,
        #[prost(bytes = "bytes", tag = "3")]
        pub serialized_expression: ::prost::bytes::Bytes,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CaveatParameter {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub type_name: ::prost::alloc::string::String,
    }

    /// Canonical serialized form of a revision, used as the stable
    /// snapshot-cache key component.
    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct RevisionKey {
        #[prost(uint64, tag = "1")]
        pub integral: u64,
        #[prost(uint64, tag = "2")]
        pub fractional: u64,
    }
}

impl schema::NamespaceDefinition {
    /// Convenience constructor for a namespace with no relations.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relations: Vec::new(),
        }
    }
}

impl schema::CaveatDefinition {
    /// Convenience constructor for a caveat with no parameters.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            serialized_expression: ::prost::bytes::Bytes::new(),
        }
    }
}
