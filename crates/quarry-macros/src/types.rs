//! Rust type inspection for field inference.

use proc_macro2::TokenStream;
use quote::quote;
use syn::Type;

/// The shape of a struct field, decided from its Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape<'a> {
    /// `Option<T>`: nullable scalar, or (as `Option<Box<T>>`) a to-one
    /// relation slot.
    Optional(&'a Type),
    /// `Vec<T>` for any `T` but `u8`: a to-many relation slot.
    Many(&'a Type),
    /// Anything else.
    Plain(&'a Type),
}

impl<'a> Shape<'a> {
    pub fn of(ty: &'a Type) -> Self {
        if let Some(inner) = generic_arg(ty, "Option") {
            return Self::Optional(inner);
        }
        match generic_arg(ty, "Vec") {
            Some(inner) if type_to_string(inner) != "u8" => Self::Many(inner),
            _ => Self::Plain(ty),
        }
    }

    /// True for `Option<Box<T>>`, the only to-one slot shape.
    pub fn is_boxed_option(self) -> bool {
        matches!(self, Self::Optional(inner) if generic_arg(inner, "Box").is_some())
    }

    /// The scalar type behind the shape.
    pub const fn scalar(self) -> &'a Type {
        match self {
            Self::Optional(t) | Self::Many(t) | Self::Plain(t) => t,
        }
    }
}

/// If `ty` is `Wrapper<T>`, returns `T`.
fn generic_arg<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    let syn::PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first() {
        Some(syn::GenericArgument::Type(inner)) => Some(inner),
        _ => None,
    }
}

/// Converts a `syn::Type` to a string for matching.
pub fn type_to_string(ty: &Type) -> String {
    quote!(#ty).to_string()
}

/// Infers the `FieldType` variant name for a scalar Rust type.
///
/// Integer primary keys become auto fields.
pub fn infer_field_type(ty: &Type, primary_key: bool) -> &'static str {
    let type_str = type_to_string(ty);
    match type_str.as_str() {
        "i64" if primary_key => "BigAutoField",
        "i32" if primary_key => "AutoField",
        "i64" => "BigIntegerField",
        "i32" => "IntegerField",
        "i16" => "SmallIntegerField",
        "f64" | "f32" => "FloatField",
        "bool" => "BooleanField",
        "String" => "CharField",
        _ if type_str.contains("NaiveDateTime") || type_str.contains("DateTime") => {
            "DateTimeField"
        }
        _ if type_str.contains("NaiveDate") => "DateField",
        _ if type_str.contains("NaiveTime") => "TimeField",
        _ if type_str.contains("Uuid") => "UuidField",
        _ if type_str.contains("serde_json") => "JsonField",
        _ if type_str.replace(' ', "") == "Vec<u8>" => "BinaryField",
        _ => "TextField",
    }
}

/// Builds `<krate>::fields::FieldType::<variant>`.
pub fn field_type_tokens(krate: &TokenStream, variant: &str) -> TokenStream {
    let ident = syn::Ident::new(variant, proc_macro2::Span::call_site());
    quote! { #krate::fields::FieldType::#ident }
}
