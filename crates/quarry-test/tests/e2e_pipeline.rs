//! End-to-end pipeline tests for quarry.
//!
//! These tests exercise the COMPLETE path:
//!   query set -> compiler -> SQL -> SQLite -> rows -> hydrated object graph
//!
//! Every test runs against a fresh in-memory database created from the
//! fixture models in `quarry_db::testing`.

use std::sync::Arc;

use indexmap::IndexMap;
use quarry_core::QuarryError;
use quarry_db::query::Compiler;
use quarry_db::testing::{Author, Book, Category, Image, Profile, Tag, Todo, TodoTag, User};
use quarry_db::{params, Expr, Value};
use quarry_test::fixtures::sqlite_compiler;
use quarry_test::TestDatabase;

async fn setup() -> (TestDatabase, Arc<Compiler>) {
    sqlite_compiler().await.unwrap()
}

async fn todo(compiler: &Arc<Compiler>, title: &str, user: Option<&User>) -> Todo {
    compiler
        .objects::<Todo>()
        .create(&Todo {
            title: title.to_string(),
            user: user.map(|u| Box::new(u.clone())),
            ..Todo::default()
        })
        .await
        .unwrap()
}

async fn user(compiler: &Arc<Compiler>, name: &str) -> User {
    compiler
        .objects::<User>()
        .create(&User {
            name: name.to_string(),
            ..User::default()
        })
        .await
        .unwrap()
}

// ============================================================================
// Create / read
// ============================================================================

#[tokio::test]
async fn test_create_then_get() {
    let (_db, compiler) = setup().await;
    let created = todo(&compiler, "T1", None).await;
    assert!(created.id > 0);
    assert!(!created.done);

    let fetched = compiler
        .objects::<Todo>()
        .filter(("ID", created.id))
        .get()
        .await
        .unwrap();
    assert_eq!(fetched.title, "T1");
    assert_eq!(fetched.id, created.id);
    assert!(fetched.user.is_none());
}

#[tokio::test]
async fn test_get_without_match_is_no_rows() {
    let (_db, compiler) = setup().await;
    let err = compiler
        .objects::<Todo>()
        .filter(("Title", "missing"))
        .get()
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::NoRows(_)));
}

#[tokio::test]
async fn test_get_with_two_matches_is_multiple_rows() {
    let (_db, compiler) = setup().await;
    todo(&compiler, "dup", None).await;
    todo(&compiler, "dup", None).await;
    let err = compiler
        .objects::<Todo>()
        .filter(("Title", "dup"))
        .get()
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::MultipleRows(_)));
}

#[tokio::test]
async fn test_computed_field_is_selected() {
    let (_db, compiler) = setup().await;
    user(&compiler, "Ann").await;
    let found = compiler.objects::<User>().first().await.unwrap().unwrap();
    assert_eq!(found.greeting, "Hi Ann");
}

#[tokio::test]
async fn test_get_or_create() {
    let (_db, compiler) = setup().await;
    let qs = compiler.objects::<Tag>().filter(("Name", "urgent"));
    let defaults = Tag {
        name: "urgent".to_string(),
        ..Tag::default()
    };
    let (first, created) = qs.get_or_create(&defaults).await.unwrap();
    assert!(created);
    let (second, created) = qs.get_or_create(&defaults).await.unwrap();
    assert!(!created);
    assert_eq!(first.id, second.id);
}

// ============================================================================
// Nested selects
// ============================================================================

#[tokio::test]
async fn test_nested_select_hydrates_the_chain() {
    let (_db, compiler) = setup().await;
    let image = compiler
        .objects::<Image>()
        .create(&Image {
            path: "p".to_string(),
            ..Image::default()
        })
        .await
        .unwrap();
    let profile = compiler
        .objects::<Profile>()
        .create(&Profile {
            name: "main".to_string(),
            email: "someone@Example.com".to_string(),
            image: Some(Box::new(image)),
            ..Profile::default()
        })
        .await
        .unwrap();
    let owner = compiler
        .objects::<User>()
        .create(&User {
            name: "owner".to_string(),
            profile: Some(Box::new(profile)),
            ..User::default()
        })
        .await
        .unwrap();
    todo(&compiler, "T1", Some(&owner)).await;

    let found = compiler
        .objects::<Todo>()
        .select(&["*", "User.*", "User.Profile.*", "User.Profile.Image.*"])
        .filter(("User.Profile.Email__icontains", "example"))
        .first()
        .await
        .unwrap()
        .unwrap();

    let user = found.user.as_ref().unwrap();
    assert_eq!(user.name, "owner");
    let profile = user.profile.as_ref().unwrap();
    assert_eq!(profile.email, "someone@Example.com");
    assert_eq!(profile.image.as_ref().unwrap().path, "p");
}

#[tokio::test]
async fn test_unselected_relation_is_a_stub() {
    let (_db, compiler) = setup().await;
    let owner = user(&compiler, "owner").await;
    todo(&compiler, "T1", Some(&owner)).await;

    let found = compiler.objects::<Todo>().first().await.unwrap().unwrap();
    let stub = found.user.as_ref().unwrap();
    assert_eq!(stub.id, owner.id);
    assert_eq!(stub.name, "");
}

#[tokio::test]
async fn test_recursive_categories() {
    let (_db, compiler) = setup().await;
    let categories = compiler.objects::<Category>();
    let root = categories
        .create(&Category {
            name: "Root".to_string(),
            ..Category::default()
        })
        .await
        .unwrap();
    let child = categories
        .create(&Category {
            name: "Child".to_string(),
            parent: Some(Box::new(root.clone())),
            ..Category::default()
        })
        .await
        .unwrap();
    categories
        .create(&Category {
            name: "Grandchild".to_string(),
            parent: Some(Box::new(child.clone())),
            ..Category::default()
        })
        .await
        .unwrap();

    let found = categories
        .select(&["*", "Parent.ID", "Parent.Parent.*"])
        .filter(("Parent.Parent.Name", "Root"))
        .all()
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    let grandchild = &found[0];
    assert_eq!(grandchild.name, "Grandchild");
    let parent = grandchild.parent.as_ref().unwrap();
    assert_eq!(parent.id, child.id);
    assert_eq!(parent.name, "");
    let grandparent = parent.parent.as_ref().unwrap();
    assert_eq!(grandparent.id, root.id);
    assert_eq!(grandparent.name, "Root");
}

#[tokio::test]
async fn test_many_to_many_filter() {
    let (_db, compiler) = setup().await;
    let home = todo(&compiler, "home", None).await;
    todo(&compiler, "work", None).await;
    let tag = compiler
        .objects::<Tag>()
        .create(&Tag {
            name: "chores".to_string(),
            ..Tag::default()
        })
        .await
        .unwrap();
    compiler
        .objects::<TodoTag>()
        .create(&TodoTag {
            todo: Some(Box::new(home.clone())),
            tag: Some(Box::new(tag)),
            ..TodoTag::default()
        })
        .await
        .unwrap();

    let tagged = compiler
        .objects::<Todo>()
        .filter(("Tags.Name", "chores"))
        .all()
        .await
        .unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].id, home.id);
}

#[tokio::test]
async fn test_reverse_one_to_many_collapses_parents() {
    let (_db, compiler) = setup().await;
    let busy = user(&compiler, "busy").await;
    let idle = user(&compiler, "idle").await;
    for title in ["t1", "t2", "t3"] {
        todo(&compiler, title, Some(&busy)).await;
    }

    let users = compiler
        .objects::<User>()
        .select(&["*", "TodoSet.*"])
        .order_by(&["ID"])
        .all()
        .await
        .unwrap();

    assert_eq!(users.len(), 2);
    assert_eq!(users[0].id, busy.id);
    let mut titles: Vec<&str> = users[0].todo_set.iter().map(|t| t.title.as_str()).collect();
    titles.sort_unstable();
    assert_eq!(titles, ["t1", "t2", "t3"]);
    assert!(users[0].todo_set.iter().all(|t| t.id > 0));
    assert_eq!(users[1].id, idle.id);
    assert!(users[1].todo_set.is_empty());
}

#[tokio::test]
async fn test_skipped_intermediate_keeps_foreign_key() {
    let (_db, compiler) = setup().await;
    let profile = compiler
        .objects::<Profile>()
        .create(&Profile {
            name: "main".to_string(),
            email: "e@x".to_string(),
            ..Profile::default()
        })
        .await
        .unwrap();
    let owner = compiler
        .objects::<User>()
        .create(&User {
            name: "owner".to_string(),
            profile: Some(Box::new(profile.clone())),
            ..User::default()
        })
        .await
        .unwrap();
    todo(&compiler, "owned", Some(&owner)).await;
    todo(&compiler, "orphan", None).await;

    let todos = compiler
        .objects::<Todo>()
        .select(&["*", "User.Profile.*"])
        .order_by(&["ID"])
        .all()
        .await
        .unwrap();

    assert_eq!(todos.len(), 2);
    let user = todos[0].user.as_ref().unwrap();
    assert_eq!(user.id, owner.id);
    assert_eq!(user.profile.as_ref().unwrap().id, profile.id);
    assert!(todos[1].user.is_none());
}

// ============================================================================
// Lookups
// ============================================================================

#[tokio::test]
async fn test_iexact_exists() {
    let (_db, compiler) = setup().await;
    todo(&compiler, "Case", None).await;
    let exists = compiler
        .objects::<Todo>()
        .filter(("Title__iexact", "CASE"))
        .exists()
        .await
        .unwrap();
    assert!(exists);
    let missing = compiler
        .objects::<Todo>()
        .filter(("Title__iexact", "CASES"))
        .exists()
        .await
        .unwrap();
    assert!(!missing);
}

async fn seed_lookups(compiler: &Arc<Compiler>) {
    let owner = user(compiler, "owner").await;
    todo(compiler, "Alpha", Some(&owner)).await;
    todo(compiler, "beta", Some(&owner)).await;
    todo(compiler, "Gamma", None).await;
    todo(compiler, "delta", None).await;
}

async fn ids(compiler: &Arc<Compiler>, filter: Expr) -> Vec<i64> {
    compiler
        .objects::<Todo>()
        .filter(filter)
        .order_by(&["ID"])
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect()
}

#[tokio::test]
async fn test_lookups_against_sqlite() {
    let (_db, compiler) = setup().await;
    seed_lookups(&compiler).await;

    let cases: Vec<(&str, Value, Vec<i64>)> = vec![
        ("Title", Value::from("Alpha"), vec![1]),
        ("Title__exact", Value::from("Alpha"), vec![1]),
        ("Title__iexact", Value::from("alpha"), vec![1]),
        ("Title__not", Value::from("Alpha"), vec![2, 3, 4]),
        ("Title__contains", Value::from("lph"), vec![1]),
        ("Title__icontains", Value::from("ET"), vec![2]),
        ("Title__startswith", Value::from("Ga"), vec![3]),
        ("Title__istartswith", Value::from("DE"), vec![4]),
        ("Title__endswith", Value::from("ta"), vec![2, 4]),
        ("Title__iendswith", Value::from("MMA"), vec![3]),
        ("Title__contains", Value::from("ALPHA"), vec![]),
        ("Title__icontains", Value::from("ALPHA"), vec![1]),
        ("Title__startswith", Value::from("ga"), vec![]),
        ("Title__istartswith", Value::from("ga"), vec![3]),
        ("Title__endswith", Value::from("TA"), vec![]),
        ("Title__iendswith", Value::from("TA"), vec![2, 4]),
        ("Title__contains", Value::from("a*"), vec![]),
        ("Title__startswith", Value::from("?eta"), vec![]),
        ("ID__gt", Value::Int(2), vec![3, 4]),
        ("ID__gte", Value::Int(2), vec![2, 3, 4]),
        ("ID__lt", Value::Int(2), vec![1]),
        ("ID__lte", Value::Int(2), vec![1, 2]),
        ("ID__in", Value::list([1, 3]), vec![1, 3]),
        ("ID__range", Value::list([2, 3]), vec![2, 3]),
        ("User__isnull", Value::Bool(true), vec![3, 4]),
        ("User__isnull", Value::Bool(false), vec![1, 2]),
        ("Title__regex", Value::from("^[A-Z]"), vec![1, 3]),
        ("Title__iregex", Value::from("^a"), vec![1]),
        ("ID__bitand", Value::Int(1), vec![1, 3]),
        ("ID__bitor", Value::Int(0), vec![1, 2, 3, 4]),
        ("ID__bitxor", Value::Int(1), vec![2, 3, 4]),
    ];

    for (key, value, expected) in cases {
        let found = ids(&compiler, Expr::from((key, value.clone()))).await;
        assert_eq!(found, expected, "{key} = {value:?}");
    }
}

#[tokio::test]
async fn test_exclude_and_or() {
    let (_db, compiler) = setup().await;
    seed_lookups(&compiler).await;

    let found = compiler
        .objects::<Todo>()
        .exclude(("Title__startswith", "A"))
        .filter(Expr::or(vec![
            Expr::from(("Title", "beta")),
            Expr::from(("Title", "Gamma")),
        ]))
        .order_by(&["-ID"])
        .all()
        .await
        .unwrap();
    let titles: Vec<&str> = found.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(titles, ["Gamma", "beta"]);
}

#[tokio::test]
async fn test_count_limit_offset() {
    let (_db, compiler) = setup().await;
    seed_lookups(&compiler).await;

    let qs = compiler.objects::<Todo>();
    assert_eq!(qs.count().await.unwrap(), 4);
    assert_eq!(qs.filter(("User__isnull", true)).count().await.unwrap(), 2);

    let page = qs.order_by(&["ID"]).limit(2).offset(1).all().await.unwrap();
    let titles: Vec<&str> = page.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(titles, ["beta", "Gamma"]);

    let last = qs.order_by(&["ID"]).last().await.unwrap().unwrap();
    assert_eq!(last.title, "delta");
}

// ============================================================================
// Aggregates and projections
// ============================================================================

#[tokio::test]
async fn test_aggregate_with_raw_fields() {
    let (_db, compiler) = setup().await;
    let rowling = compiler
        .objects::<Author>()
        .create(&Author {
            name: "Rowling".to_string(),
            ..Author::default()
        })
        .await
        .unwrap();
    let tolkien = compiler
        .objects::<Author>()
        .create(&Author {
            name: "Tolkien".to_string(),
            ..Author::default()
        })
        .await
        .unwrap();
    for (title, author) in [
        ("Philosopher's Stone", &rowling),
        ("Chamber of Secrets", &rowling),
        ("The Hobbit", &tolkien),
    ] {
        compiler
            .objects::<Book>()
            .create(&Book {
                title: title.to_string(),
                author: Some(Box::new(author.clone())),
                ..Book::default()
            })
            .await
            .unwrap();
    }

    let mut spec = IndexMap::new();
    spec.insert(
        "Author".to_string(),
        Expr::raw_fields("%s", &["Author.Name"]).unwrap(),
    );
    spec.insert("CountBooks".to_string(), Expr::raw("COUNT(*)", vec![]).unwrap());
    let totals = compiler
        .objects::<Book>()
        .filter(("Author.Name", "Rowling"))
        .aggregate(spec)
        .await
        .unwrap();

    assert_eq!(totals["Author"], Value::from("Rowling"));
    assert_eq!(totals["CountBooks"], Value::Int(2));
}

#[tokio::test]
async fn test_values_follow_relations() {
    let (_db, compiler) = setup().await;
    let owner = user(&compiler, "owner").await;
    todo(&compiler, "T1", Some(&owner)).await;

    let rows = compiler
        .objects::<Todo>()
        .values(&["Title", "User.Name"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["Title"], Value::from("T1"));
    assert_eq!(rows[0]["User.Name"], Value::from("owner"));
}

#[tokio::test]
async fn test_required_foreign_key_rejects_null() {
    let (_db, compiler) = setup().await;
    let err = compiler
        .objects::<Book>()
        .create(&Book {
            title: "Orphan".to_string(),
            ..Book::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::FieldNull(_)), "{err:?}");
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn test_expression_update() {
    let (_db, compiler) = setup().await;
    let created = todo(&compiler, "hi", None).await;
    assert_eq!(created.id, 1);

    let changed = compiler
        .objects::<Todo>()
        .filter(("ID", created.id))
        .update(
            &created,
            vec![
                Expr::update("![Title]=UPPER(![Title])", vec![]).unwrap(),
                Expr::update(
                    "![Done]=(![ID]%?[1]=?[2] OR ![ID]%?[1]=?[3] OR ?[4])",
                    params![2, 0, 1, true],
                )
                .unwrap(),
            ],
        )
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let fetched = compiler
        .objects::<Todo>()
        .filter(("ID", created.id))
        .get()
        .await
        .unwrap();
    assert_eq!(fetched.title, "HI");
    assert!(fetched.done);
}

#[tokio::test]
async fn test_update_writes_selected_fields() {
    let (_db, compiler) = setup().await;
    let mut created = todo(&compiler, "draft", None).await;
    created.title = "final".to_string();
    created.done = true;

    compiler
        .objects::<Todo>()
        .select(&["Title"])
        .update(&created, vec![])
        .await
        .unwrap();

    let fetched = compiler
        .objects::<Todo>()
        .filter(("ID", created.id))
        .get()
        .await
        .unwrap();
    assert_eq!(fetched.title, "final");
    assert!(!fetched.done);
}

#[tokio::test]
async fn test_delete_through_relation_filter() {
    let (_db, compiler) = setup().await;
    let owner = user(&compiler, "owner").await;
    let other = user(&compiler, "other").await;
    todo(&compiler, "a", Some(&owner)).await;
    todo(&compiler, "b", Some(&owner)).await;
    todo(&compiler, "c", Some(&other)).await;

    let deleted = compiler
        .objects::<Todo>()
        .filter(("User.Name", "owner"))
        .delete()
        .await
        .unwrap();
    assert_eq!(deleted, 2);

    let left = compiler.objects::<Todo>().all().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].title, "c");
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn test_rollback_discards_writes() {
    let (_db, compiler) = setup().await;
    compiler.start_transaction(None).await.unwrap();
    todo(&compiler, "temp", None).await;
    assert!(compiler.in_transaction());
    compiler.rollback().await.unwrap();

    assert_eq!(compiler.objects::<Todo>().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_commit_keeps_writes() {
    let (_db, compiler) = setup().await;
    compiler.start_transaction(None).await.unwrap();
    todo(&compiler, "kept", None).await;
    compiler.commit().await.unwrap();

    assert!(!compiler.in_transaction());
    assert_eq!(compiler.objects::<Todo>().count().await.unwrap(), 1);
    assert!(matches!(
        compiler.commit().await,
        Err(QuarryError::NoTransaction)
    ));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_counts_agree() {
    let (_db, compiler) = setup().await;
    seed_lookups(&compiler).await;
    let qs = compiler.objects::<Todo>().filter(("Title__icontains", "a"));

    let handles: Vec<_> = (0..1000)
        .map(|_| {
            let qs = qs.clone();
            tokio::spawn(async move { qs.count().await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 4);
    }
}
