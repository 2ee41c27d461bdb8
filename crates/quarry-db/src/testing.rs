//! Test fixtures: a small model graph and an in-memory executor.
//!
//! The graph covers every relation shape the engine handles:
//!
//! ```text
//! Todo --User--> User --Profile (1:1)--> Profile --Image--> Image
//!  |
//!  +--Tags (m2m through TodoTag)--> Tag
//!
//! Category --Parent--> Category          Book --Author--> Author ("Books")
//! ```
//!
//! [`MockExecutor`] records every statement it receives and answers queries
//! from a queue of canned result sets.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use quarry_core::QuarryResult;

use crate::driver::Driver;
use crate::executor::DbExecutor;
use crate::fields::{FieldDef, FieldType, Through};
use crate::model::{downcast, Instance, Model, ModelDef};
use crate::registry::{ModelRegistry, RegistryBuilder};
use crate::row::{FromValue, Row};
use crate::value::Value;

// ── Helpers ────────────────────────────────────────────────────────────

fn assign<T: FromValue>(slot: &mut T, value: &Value) -> QuarryResult<()> {
    *slot = T::from_value(value)?;
    Ok(())
}

fn key_of<T: Instance>(related: Option<&T>) -> Value {
    related
        .and_then(|r| r.get_field("ID"))
        .unwrap_or(Value::Null)
}

fn stub<T: Model>(value: &Value) -> QuarryResult<Option<Box<T>>> {
    if value.is_null() {
        return Ok(None);
    }
    let mut related = T::default();
    related.set_field("ID", value.clone())?;
    Ok(Some(Box::new(related)))
}

fn unknown(model: &str, field: &str) -> quarry_core::QuarryError {
    quarry_core::QuarryError::FieldNotFound(format!("{model}.{field}"))
}

fn not_a_relation(model: &str, relation: &str) -> quarry_core::QuarryError {
    quarry_core::QuarryError::NotARelation(format!("{model}.{relation}"))
}

fn pk() -> FieldDef {
    FieldDef::new("ID", FieldType::BigAutoField)
        .column("id")
        .primary_key()
}

// ── User ───────────────────────────────────────────────────────────────

/// A user with an optional one-to-one profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub greeting: String,
    pub profile: Option<Box<Profile>>,
    pub todo_set: Vec<Todo>,
}

impl Instance for User {
    fn model_name(&self) -> &'static str {
        "User"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "ID" => Some(Value::Int(self.id)),
            "Name" => Some(Value::from(self.name.as_str())),
            "Greeting" => Some(Value::from(self.greeting.as_str())),
            "Profile" => Some(key_of(self.profile.as_deref())),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> QuarryResult<()> {
        match field {
            "ID" => assign(&mut self.id, &value),
            "Name" => assign(&mut self.name, &value),
            "Greeting" => assign(&mut self.greeting, &value),
            "Profile" => {
                self.profile = stub(&value)?;
                Ok(())
            }
            _ => Err(unknown("User", field)),
        }
    }

    fn set_related(&mut self, relation: &str, related: Box<dyn Instance>) -> QuarryResult<()> {
        match relation {
            "Profile" => self.profile = Some(Box::new(downcast(related)?)),
            "TodoSet" => self.todo_set.push(downcast(related)?),
            _ => return Err(not_a_relation("User", relation)),
        }
        Ok(())
    }
}

impl Model for User {
    fn definition() -> ModelDef {
        ModelDef::new("User", "users")
            .field(pk())
            .field(FieldDef::new("Name", FieldType::CharField).column("name"))
            .field(FieldDef::one_to_one("Profile", "Profile", "profile_id").nullable())
            .field(FieldDef::computed(
                "Greeting",
                "'Hi ' || ![Name]",
                FieldType::TextField,
            ))
    }
}

// ── Profile ────────────────────────────────────────────────────────────

/// A user profile pointing at an avatar image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub image: Option<Box<Image>>,
    pub user: Option<Box<User>>,
}

impl Instance for Profile {
    fn model_name(&self) -> &'static str {
        "Profile"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "ID" => Some(Value::Int(self.id)),
            "Name" => Some(Value::from(self.name.as_str())),
            "Email" => Some(Value::from(self.email.as_str())),
            "Image" => Some(key_of(self.image.as_deref())),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> QuarryResult<()> {
        match field {
            "ID" => assign(&mut self.id, &value),
            "Name" => assign(&mut self.name, &value),
            "Email" => assign(&mut self.email, &value),
            "Image" => {
                self.image = stub(&value)?;
                Ok(())
            }
            _ => Err(unknown("Profile", field)),
        }
    }

    fn set_related(&mut self, relation: &str, related: Box<dyn Instance>) -> QuarryResult<()> {
        match relation {
            "Image" => self.image = Some(Box::new(downcast(related)?)),
            "User" => self.user = Some(Box::new(downcast(related)?)),
            _ => return Err(not_a_relation("Profile", relation)),
        }
        Ok(())
    }
}

impl Model for Profile {
    fn definition() -> ModelDef {
        ModelDef::new("Profile", "profiles")
            .field(pk())
            .field(FieldDef::new("Name", FieldType::CharField).column("name"))
            .field(FieldDef::new("Email", FieldType::CharField).column("email"))
            .field(FieldDef::foreign_key("Image", "Image", "image_id").nullable())
    }
}

// ── Image ──────────────────────────────────────────────────────────────

/// An image file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Image {
    pub id: i64,
    pub path: String,
    pub profile_set: Vec<Profile>,
}

impl Instance for Image {
    fn model_name(&self) -> &'static str {
        "Image"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "ID" => Some(Value::Int(self.id)),
            "Path" => Some(Value::from(self.path.as_str())),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> QuarryResult<()> {
        match field {
            "ID" => assign(&mut self.id, &value),
            "Path" => assign(&mut self.path, &value),
            _ => Err(unknown("Image", field)),
        }
    }

    fn set_related(&mut self, relation: &str, related: Box<dyn Instance>) -> QuarryResult<()> {
        match relation {
            "ProfileSet" => self.profile_set.push(downcast(related)?),
            _ => return Err(not_a_relation("Image", relation)),
        }
        Ok(())
    }
}

impl Model for Image {
    fn definition() -> ModelDef {
        ModelDef::new("Image", "images")
            .field(pk())
            .field(FieldDef::new("Path", FieldType::CharField).column("path"))
    }
}

// ── Todo ───────────────────────────────────────────────────────────────

/// A todo item owned by a user and tagged through `TodoTag`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Todo {
    pub id: i64,
    pub title: String,
    pub done: bool,
    pub user: Option<Box<User>>,
    pub tags: Vec<Tag>,
}

impl Instance for Todo {
    fn model_name(&self) -> &'static str {
        "Todo"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "ID" => Some(Value::Int(self.id)),
            "Title" => Some(Value::from(self.title.as_str())),
            "Done" => Some(Value::Bool(self.done)),
            "User" => Some(key_of(self.user.as_deref())),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> QuarryResult<()> {
        match field {
            "ID" => assign(&mut self.id, &value),
            "Title" => assign(&mut self.title, &value),
            "Done" => assign(&mut self.done, &value),
            "User" => {
                self.user = stub(&value)?;
                Ok(())
            }
            _ => Err(unknown("Todo", field)),
        }
    }

    fn set_related(&mut self, relation: &str, related: Box<dyn Instance>) -> QuarryResult<()> {
        match relation {
            "User" => self.user = Some(Box::new(downcast(related)?)),
            "Tags" => self.tags.push(downcast(related)?),
            _ => return Err(not_a_relation("Todo", relation)),
        }
        Ok(())
    }
}

impl Model for Todo {
    fn definition() -> ModelDef {
        ModelDef::new("Todo", "todos")
            .field(pk())
            .field(FieldDef::new("Title", FieldType::CharField).column("title"))
            .field(
                FieldDef::new("Done", FieldType::BooleanField)
                    .column("done")
                    .default(false),
            )
            .field(FieldDef::foreign_key("User", "User", "user_id").nullable())
            .field(FieldDef::many_to_many(
                "Tags",
                "Tag",
                Through::new("TodoTag", "Todo", "Tag"),
            ))
    }
}

// ── Tag ────────────────────────────────────────────────────────────────

/// A label attached to todos.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub todo_set: Vec<Todo>,
}

impl Instance for Tag {
    fn model_name(&self) -> &'static str {
        "Tag"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "ID" => Some(Value::Int(self.id)),
            "Name" => Some(Value::from(self.name.as_str())),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> QuarryResult<()> {
        match field {
            "ID" => assign(&mut self.id, &value),
            "Name" => assign(&mut self.name, &value),
            _ => Err(unknown("Tag", field)),
        }
    }

    fn set_related(&mut self, relation: &str, related: Box<dyn Instance>) -> QuarryResult<()> {
        match relation {
            "TodoSet" => self.todo_set.push(downcast(related)?),
            _ => return Err(not_a_relation("Tag", relation)),
        }
        Ok(())
    }
}

impl Model for Tag {
    fn definition() -> ModelDef {
        ModelDef::new("Tag", "tags")
            .field(pk())
            .field(FieldDef::new("Name", FieldType::CharField).column("name"))
    }
}

// ── TodoTag ────────────────────────────────────────────────────────────

/// The link table between todos and tags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TodoTag {
    pub id: i64,
    pub todo: Option<Box<Todo>>,
    pub tag: Option<Box<Tag>>,
}

impl Instance for TodoTag {
    fn model_name(&self) -> &'static str {
        "TodoTag"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "ID" => Some(Value::Int(self.id)),
            "Todo" => Some(key_of(self.todo.as_deref())),
            "Tag" => Some(key_of(self.tag.as_deref())),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> QuarryResult<()> {
        match field {
            "ID" => assign(&mut self.id, &value),
            "Todo" => {
                self.todo = stub(&value)?;
                Ok(())
            }
            "Tag" => {
                self.tag = stub(&value)?;
                Ok(())
            }
            _ => Err(unknown("TodoTag", field)),
        }
    }

    fn set_related(&mut self, relation: &str, related: Box<dyn Instance>) -> QuarryResult<()> {
        match relation {
            "Todo" => self.todo = Some(Box::new(downcast(related)?)),
            "Tag" => self.tag = Some(Box::new(downcast(related)?)),
            _ => return Err(not_a_relation("TodoTag", relation)),
        }
        Ok(())
    }
}

impl Model for TodoTag {
    fn definition() -> ModelDef {
        ModelDef::new("TodoTag", "todo_tags")
            .field(pk())
            .field(FieldDef::foreign_key("Todo", "Todo", "todo_id"))
            .field(FieldDef::foreign_key("Tag", "Tag", "tag_id"))
    }
}

// ── Category ───────────────────────────────────────────────────────────

/// A self-referencing tree node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub parent: Option<Box<Category>>,
    pub category_set: Vec<Category>,
}

impl Instance for Category {
    fn model_name(&self) -> &'static str {
        "Category"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "ID" => Some(Value::Int(self.id)),
            "Name" => Some(Value::from(self.name.as_str())),
            "Parent" => Some(key_of(self.parent.as_deref())),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> QuarryResult<()> {
        match field {
            "ID" => assign(&mut self.id, &value),
            "Name" => assign(&mut self.name, &value),
            "Parent" => {
                self.parent = stub(&value)?;
                Ok(())
            }
            _ => Err(unknown("Category", field)),
        }
    }

    fn set_related(&mut self, relation: &str, related: Box<dyn Instance>) -> QuarryResult<()> {
        match relation {
            "Parent" => self.parent = Some(Box::new(downcast(related)?)),
            "CategorySet" => self.category_set.push(downcast(related)?),
            _ => return Err(not_a_relation("Category", relation)),
        }
        Ok(())
    }
}

impl Model for Category {
    fn definition() -> ModelDef {
        ModelDef::new("Category", "categories")
            .field(pk())
            .field(FieldDef::new("Name", FieldType::CharField).column("name"))
            .field(FieldDef::foreign_key("Parent", "Category", "parent_id").nullable())
    }
}

// ── Author / Book ──────────────────────────────────────────────────────

/// A book author; the reverse side is exposed as `Books`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Author {
    pub id: i64,
    pub name: String,
    pub books: Vec<Book>,
}

impl Instance for Author {
    fn model_name(&self) -> &'static str {
        "Author"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "ID" => Some(Value::Int(self.id)),
            "Name" => Some(Value::from(self.name.as_str())),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> QuarryResult<()> {
        match field {
            "ID" => assign(&mut self.id, &value),
            "Name" => assign(&mut self.name, &value),
            _ => Err(unknown("Author", field)),
        }
    }

    fn set_related(&mut self, relation: &str, related: Box<dyn Instance>) -> QuarryResult<()> {
        match relation {
            "Books" => self.books.push(downcast(related)?),
            _ => return Err(not_a_relation("Author", relation)),
        }
        Ok(())
    }
}

impl Model for Author {
    fn definition() -> ModelDef {
        ModelDef::new("Author", "authors")
            .field(pk())
            .field(FieldDef::new("Name", FieldType::CharField).column("name"))
    }
}

/// A book with a required author.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub author: Option<Box<Author>>,
}

impl Instance for Book {
    fn model_name(&self) -> &'static str {
        "Book"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "ID" => Some(Value::Int(self.id)),
            "Title" => Some(Value::from(self.title.as_str())),
            "Author" => Some(key_of(self.author.as_deref())),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> QuarryResult<()> {
        match field {
            "ID" => assign(&mut self.id, &value),
            "Title" => assign(&mut self.title, &value),
            "Author" => {
                self.author = stub(&value)?;
                Ok(())
            }
            _ => Err(unknown("Book", field)),
        }
    }

    fn set_related(&mut self, relation: &str, related: Box<dyn Instance>) -> QuarryResult<()> {
        match relation {
            "Author" => self.author = Some(Box::new(downcast(related)?)),
            _ => return Err(not_a_relation("Book", relation)),
        }
        Ok(())
    }
}

impl Model for Book {
    fn definition() -> ModelDef {
        ModelDef::new("Book", "books")
            .field(pk())
            .field(FieldDef::new("Title", FieldType::CharField).column("title"))
            .field(FieldDef::foreign_key("Author", "Author", "author_id").related_name("Books"))
    }
}

// ── Registry ───────────────────────────────────────────────────────────

/// A builder with every fixture model registered.
pub fn builder() -> RegistryBuilder {
    let mut builder = RegistryBuilder::new();
    builder
        .register::<User>()
        .register::<Profile>()
        .register::<Image>()
        .register::<Todo>()
        .register::<Tag>()
        .register::<TodoTag>()
        .register::<Category>()
        .register::<Author>()
        .register::<Book>();
    builder
}

/// The built fixture registry.
///
/// # Panics
///
/// Panics if the fixture graph is inconsistent.
#[allow(clippy::expect_used)]
pub fn registry() -> ModelRegistry {
    builder().build().expect("fixture registry builds")
}

// ── MockExecutor ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MockState {
    results: VecDeque<Vec<Row>>,
    calls: Vec<(String, Vec<Value>)>,
}

/// An executor that records statements and replays canned rows.
///
/// Each `query` pops the next queued result set, or returns no rows when
/// the queue is empty. `execute` reports one affected row.
#[derive(Debug)]
pub struct MockExecutor {
    driver: Driver,
    state: Mutex<MockState>,
}

impl MockExecutor {
    /// A mock speaking `driver`.
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            state: Mutex::new(MockState::default()),
        }
    }

    /// A shared mock, ready to hand to a compiler.
    pub fn shared(driver: Driver) -> Arc<Self> {
        Arc::new(Self::new(driver))
    }

    /// Queues the result of the next query.
    pub fn push_rows(&self, rows: Vec<Row>) {
        self.lock().results.push_back(rows);
    }

    /// Every statement received, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock().calls.iter().map(|(sql, _)| sql.clone()).collect()
    }

    /// Every statement received, with its arguments.
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, sql: &str, params: &[Value]) {
        self.lock().calls.push((sql.to_string(), params.to_vec()));
    }
}

#[async_trait::async_trait]
impl DbExecutor for MockExecutor {
    fn driver(&self) -> Driver {
        self.driver
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> QuarryResult<u64> {
        self.record(sql, params);
        Ok(1)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>> {
        self.record(sql, params);
        Ok(self.lock().results.pop_front().unwrap_or_default())
    }
}

/// A one-row result with the given columns.
pub fn row(columns: &[&str], values: Vec<Value>) -> Row {
    Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values)
}
