//! `#[derive(Model)]` implementation.
//!
//! Generates `Instance` (field accessors and relation attachment) and
//! `Model` (the `ModelDef` descriptor) for a struct with named fields.
//!
//! Struct attributes, `#[model(...)]`:
//!
//! - `name = "Todo"`: registered model name (default: the struct name)
//! - `table = "todos"`: table name (default: snake case plus `s`)
//! - `crate = "quarry::db"`: path to the query engine crate
//!
//! Field attributes, `#[field(...)]`:
//!
//! - `name`, `column`, `primary_key`, `null`, `default = <expr>`,
//!   `kind = "TextField"`
//! - `foreign_key = "User"` / `one_to_one = "Profile"` on an
//!   `Option<Box<_>>` slot, with `to_field` and `related_name`
//! - `many_to_many = "Tag"` on a `Vec<_>` slot, with `through`,
//!   `through_source` and `through_target`
//! - `reverse` for a slot filled from a reverse relation
//! - `computed = "<raw template>"`
//! - `skip` to leave the struct field out of the model

use darling::{FromDeriveInput, FromField};
use heck::{ToSnakeCase, ToUpperCamelCase};
use proc_macro2::TokenStream;
use quote::quote;
use syn::DeriveInput;

use crate::types::{field_type_tokens, infer_field_type, Shape};

/// Struct-level attributes parsed from `#[model(...)]`.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(model), supports(struct_named))]
pub struct ModelOpts {
    pub ident: syn::Ident,
    pub generics: syn::Generics,
    pub data: darling::ast::Data<(), FieldOpts>,

    /// The registered model name.
    #[darling(default)]
    pub name: Option<String>,

    /// The database table name.
    #[darling(default)]
    pub table: Option<String>,

    /// Path to the `quarry_db` crate.
    #[darling(default, rename = "crate")]
    pub crate_path: Option<syn::Path>,
}

/// Per-field attributes parsed from `#[field(...)]`.
#[derive(Debug, FromField)]
#[darling(attributes(field))]
pub struct FieldOpts {
    pub ident: Option<syn::Ident>,
    pub ty: syn::Type,

    #[darling(default)]
    pub name: Option<String>,
    #[darling(default)]
    pub column: Option<String>,
    #[darling(default)]
    pub primary_key: bool,
    #[darling(default)]
    pub null: bool,
    #[darling(default)]
    pub default: Option<syn::Expr>,
    /// Overrides the inferred `FieldType` variant.
    #[darling(default)]
    pub kind: Option<String>,

    #[darling(default)]
    pub foreign_key: Option<String>,
    #[darling(default)]
    pub one_to_one: Option<String>,
    #[darling(default)]
    pub to_field: Option<String>,
    #[darling(default)]
    pub related_name: Option<String>,

    #[darling(default)]
    pub many_to_many: Option<String>,
    #[darling(default)]
    pub through: Option<String>,
    #[darling(default)]
    pub through_source: Option<String>,
    #[darling(default)]
    pub through_target: Option<String>,

    #[darling(default)]
    pub reverse: bool,
    #[darling(default)]
    pub computed: Option<String>,
    #[darling(default)]
    pub skip: bool,
}

/// What a struct field is to the model.
enum Role<'a> {
    Scalar,
    Computed(&'a str),
    ToOne { constructor: &'static str, target: &'a str },
    ManyToMany { target: &'a str },
    Reverse,
}

/// One analysed struct field.
struct Field<'a> {
    opts: &'a FieldOpts,
    ident: &'a syn::Ident,
    name: String,
    shape: Shape<'a>,
    role: Role<'a>,
}

impl<'a> Field<'a> {
    fn analyse(opts: &'a FieldOpts) -> darling::Result<Option<Self>> {
        let Some(ident) = opts.ident.as_ref() else {
            return Err(darling::Error::custom("tuple fields are not supported"));
        };
        if opts.skip {
            return Ok(None);
        }
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| ident.to_string().to_upper_camel_case());
        let shape = Shape::of(&opts.ty);

        let relations = [
            opts.foreign_key.is_some(),
            opts.one_to_one.is_some(),
            opts.many_to_many.is_some(),
            opts.reverse,
            opts.computed.is_some(),
        ];
        if relations.iter().filter(|set| **set).count() > 1 {
            return Err(darling::Error::custom(
                "at most one of foreign_key, one_to_one, many_to_many, reverse, computed",
            )
            .with_span(ident));
        }

        let role = if let Some(target) = &opts.foreign_key {
            Role::ToOne {
                constructor: "foreign_key",
                target,
            }
        } else if let Some(target) = &opts.one_to_one {
            Role::ToOne {
                constructor: "one_to_one",
                target,
            }
        } else if let Some(target) = &opts.many_to_many {
            Role::ManyToMany { target }
        } else if opts.reverse {
            Role::Reverse
        } else if let Some(template) = &opts.computed {
            Role::Computed(template)
        } else {
            Role::Scalar
        };

        match (&role, shape) {
            (Role::ToOne { .. }, s) if s.is_boxed_option() => {}
            (Role::Reverse, s) if s.is_boxed_option() => {}
            (Role::ManyToMany { .. } | Role::Reverse, Shape::Many(_))
            | (Role::Scalar | Role::Computed(_), _) => {}
            (Role::ToOne { .. }, _) => {
                return Err(darling::Error::custom(
                    "a to-one relation field must be an Option<Box<T>>",
                )
                .with_span(ident))
            }
            (Role::ManyToMany { .. }, _) => {
                return Err(
                    darling::Error::custom("a many-to-many field must be a Vec<T>").with_span(ident)
                )
            }
            (Role::Reverse, _) => {
                return Err(darling::Error::custom(
                    "a reverse relation field must be an Option<Box<_>> or a Vec<_>",
                )
                .with_span(ident))
            }
        }

        Ok(Some(Self {
            opts,
            ident,
            name,
            shape,
            role,
        }))
    }

    fn field_type(&self, krate: &TokenStream) -> TokenStream {
        let variant = self
            .opts
            .kind
            .as_deref()
            .unwrap_or_else(|| infer_field_type(self.shape.scalar(), self.opts.primary_key));
        field_type_tokens(krate, variant)
    }

    /// The `FieldDef` builder expression, or `None` for reverse slots.
    fn definition(&self, krate: &TokenStream, model: &str) -> Option<TokenStream> {
        let name = &self.name;
        let ident = self.ident.to_string();
        let mut chain = Vec::new();

        let base = match &self.role {
            Role::Reverse => return None,
            Role::Scalar => {
                let ty = self.field_type(krate);
                let column = self.opts.column.clone().unwrap_or(ident);
                if self.opts.null || matches!(self.shape, Shape::Optional(_)) {
                    chain.push(quote! { .nullable() });
                }
                quote! { #krate::fields::FieldDef::new(#name, #ty).column(#column) }
            }
            Role::Computed(template) => {
                let ty = self.field_type(krate);
                quote! { #krate::fields::FieldDef::computed(#name, #template, #ty) }
            }
            Role::ToOne {
                constructor,
                target,
            } => {
                let constructor = syn::Ident::new(constructor, proc_macro2::Span::call_site());
                let column = self
                    .opts
                    .column
                    .clone()
                    .unwrap_or_else(|| format!("{ident}_id"));
                if let Some(kind) = &self.opts.kind {
                    let ty = field_type_tokens(krate, kind);
                    chain.push(quote! { .field_type(#ty) });
                }
                if self.opts.null {
                    chain.push(quote! { .nullable() });
                }
                if let Some(to_field) = &self.opts.to_field {
                    chain.push(quote! { .to_field(#to_field) });
                }
                quote! { #krate::fields::FieldDef::#constructor(#name, #target, #column) }
            }
            Role::ManyToMany { target } => {
                let through = self
                    .opts
                    .through
                    .clone()
                    .unwrap_or_else(|| format!("{model}{target}"));
                let source = self
                    .opts
                    .through_source
                    .clone()
                    .unwrap_or_else(|| model.to_string());
                let dest = self
                    .opts
                    .through_target
                    .clone()
                    .unwrap_or_else(|| (*target).to_string());
                quote! {
                    #krate::fields::FieldDef::many_to_many(
                        #name,
                        #target,
                        #krate::fields::Through::new(#through, #source, #dest),
                    )
                }
            }
        };

        if self.opts.primary_key {
            chain.push(quote! { .primary_key() });
        }
        if let Some(default) = &self.opts.default {
            chain.push(quote! { .default(#default) });
        }
        if let Some(related_name) = &self.opts.related_name {
            chain.push(quote! { .related_name(#related_name) });
        }
        Some(quote! { #base #(#chain)* })
    }

    /// The key field name expression for a to-one slot; `fallible` is the
    /// suffix that unwraps `primary_name`'s result in context.
    fn key_field(&self, krate: &TokenStream, fallible: &TokenStream) -> TokenStream {
        if let Some(to_field) = &self.opts.to_field {
            return quote! { #to_field };
        }
        let ty = &self.opts.ty;
        quote! {
            #krate::fields::slots::primary_name::<
                <#ty as #krate::fields::ToOneSlot>::Target
            >() #fallible
        }
    }

    fn get_arm(&self, krate: &TokenStream) -> Option<TokenStream> {
        let name = &self.name;
        let ident = self.ident;
        match self.role {
            Role::Scalar | Role::Computed(_) => Some(quote! {
                #name => ::core::option::Option::Some(
                    #krate::value::Value::from(::core::clone::Clone::clone(&self.#ident))
                ),
            }),
            Role::ToOne { .. } => {
                let key = self.key_field(krate, &quote! { .ok()? });
                Some(quote! {
                    #name => {
                        let key: &str = #key;
                        ::core::option::Option::Some(
                            #krate::fields::ToOneSlot::key(&self.#ident, key)
                        )
                    }
                })
            }
            Role::ManyToMany { .. } | Role::Reverse => None,
        }
    }

    fn set_arm(&self, krate: &TokenStream) -> Option<TokenStream> {
        let name = &self.name;
        let ident = self.ident;
        match self.role {
            Role::Scalar | Role::Computed(_) => Some(quote! {
                #name => {
                    self.#ident = #krate::row::FromValue::from_value(&value)?;
                    ::core::result::Result::Ok(())
                }
            }),
            Role::ToOne { .. } => {
                let key = self.key_field(krate, &quote! { ? });
                Some(quote! {
                    #name => {
                        let key: &str = #key;
                        #krate::fields::ToOneSlot::set_key(&mut self.#ident, key, value)
                    }
                })
            }
            Role::ManyToMany { .. } | Role::Reverse => None,
        }
    }

    fn related_arm(&self, krate: &TokenStream) -> Option<TokenStream> {
        let name = &self.name;
        let ident = self.ident;
        match (&self.role, self.shape) {
            (Role::ToOne { .. } | Role::Reverse, Shape::Optional(_)) => Some(quote! {
                #name => #krate::fields::ToOneSlot::attach(&mut self.#ident, related),
            }),
            (Role::ManyToMany { .. } | Role::Reverse, Shape::Many(_)) => Some(quote! {
                #name => #krate::fields::ToManySlot::push_related(&mut self.#ident, related),
            }),
            _ => None,
        }
    }
}

/// Generates the `Instance` and `Model` implementations.
pub fn derive_model_impl(input: DeriveInput) -> TokenStream {
    let opts = match ModelOpts::from_derive_input(&input) {
        Ok(o) => o,
        Err(e) => return e.write_errors(),
    };
    match expand(&opts) {
        Ok(tokens) => tokens,
        Err(e) => e.write_errors(),
    }
}

fn expand(opts: &ModelOpts) -> darling::Result<TokenStream> {
    if !opts.generics.params.is_empty() {
        return Err(
            darling::Error::custom("#[derive(Model)] does not support generic structs")
                .with_span(&opts.generics),
        );
    }
    let Some(struct_fields) = opts.data.as_ref().take_struct() else {
        return Err(darling::Error::unsupported_shape("only named structs are supported"));
    };

    let mut errors = darling::Error::accumulator();
    let fields: Vec<Field<'_>> = struct_fields
        .fields
        .iter()
        .filter_map(|f| errors.handle(Field::analyse(f)).flatten())
        .collect();
    let primaries = fields.iter().filter(|f| f.opts.primary_key).count();
    if primaries != 1 {
        errors.push(
            darling::Error::custom(format!(
                "a model needs exactly one #[field(primary_key)], found {primaries}"
            ))
            .with_span(&opts.ident),
        );
    }
    errors.finish()?;

    let krate = match &opts.crate_path {
        Some(path) => quote! { #path },
        None => quote! { ::quarry_db },
    };
    let struct_name = &opts.ident;
    let model_name = opts
        .name
        .clone()
        .unwrap_or_else(|| struct_name.to_string());
    let table = opts
        .table
        .clone()
        .unwrap_or_else(|| format!("{}s", struct_name.to_string().to_snake_case()));

    let definitions = fields.iter().filter_map(|f| f.definition(&krate, &model_name));
    let get_arms = fields.iter().filter_map(|f| f.get_arm(&krate));
    let set_arms = fields.iter().filter_map(|f| f.set_arm(&krate));
    let related_arms = fields.iter().filter_map(|f| f.related_arm(&krate));

    Ok(quote! {
        #[automatically_derived]
        impl #krate::model::Instance for #struct_name {
            fn model_name(&self) -> &'static str {
                #model_name
            }

            fn get_field(&self, field: &str) -> ::core::option::Option<#krate::value::Value> {
                match field {
                    #(#get_arms)*
                    _ => ::core::option::Option::None,
                }
            }

            #[allow(unused_variables)]
            fn set_field(
                &mut self,
                field: &str,
                value: #krate::value::Value,
            ) -> #krate::QuarryResult<()> {
                match field {
                    #(#set_arms)*
                    _ => ::core::result::Result::Err(#krate::QuarryError::FieldNotFound(
                        ::std::format!("{}.{}", #model_name, field),
                    )),
                }
            }

            #[allow(unused_variables)]
            fn set_related(
                &mut self,
                relation: &str,
                related: ::std::boxed::Box<dyn #krate::model::Instance>,
            ) -> #krate::QuarryResult<()> {
                match relation {
                    #(#related_arms)*
                    _ => ::core::result::Result::Err(#krate::QuarryError::NotARelation(
                        ::std::format!("{}.{}", #model_name, relation),
                    )),
                }
            }
        }

        #[automatically_derived]
        impl #krate::model::Model for #struct_name {
            fn definition() -> #krate::model::ModelDef {
                #krate::model::ModelDef::new(#model_name, #table)
                    #(.field(#definitions))*
            }
        }
    })
}
