use elif_migrate::{
    ColumnDefinition, ColumnType, Database, IndexDefinition, MigrateConfig, MigrateError,
    MigrationDescriptor, MigrationLog, Migrator, Operation, RenameMap, SchemaSnapshot,
    SqliteDatabase, Strategy, TableDefinition,
};

fn users(name: ColumnDefinition, with_email: bool) -> TableDefinition {
    let mut columns = vec![
        ColumnDefinition::new("id", ColumnType::integer()).primary_key(),
        name,
    ];
    if with_email {
        columns.push(ColumnDefinition::new("email", ColumnType::varchar(255)));
    }
    TableDefinition::new("users", columns)
        .with_index(IndexDefinition::new("idx_users_name", "", ["name"]))
}

fn plain_name() -> ColumnDefinition {
    ColumnDefinition::new("name", ColumnType::varchar(100)).not_null()
}

async fn seeded(migrator: &Migrator) -> SqliteDatabase {
    let mut db = SqliteDatabase::in_memory().await.unwrap();
    let initial = SchemaSnapshot::new().with_table(users(plain_name(), true));

    let migration = migrator
        .autogenerate(&mut db, &initial, &RenameMap::new(), "20250201000000", "create users")
        .await
        .unwrap()
        .expect("empty database differs");
    migrator.apply(&mut db, &migration).await.unwrap();

    sqlx::query(
        "INSERT INTO users (id, name, email) VALUES (1, 'ada', 'ada@example.com'), (2, 'grace', NULL)",
    )
    .execute(db.connection())
    .await
    .unwrap();
    db
}

async fn names(db: &mut SqliteDatabase) -> Vec<(i64, String)> {
    sqlx::query_as("SELECT id, name FROM users ORDER BY id")
        .fetch_all(db.connection())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_created_schema_reads_back_identically() {
    let migrator = Migrator::new(MigrateConfig::default());
    let mut db = seeded(&migrator).await;

    let schema = db.read_schema().await.unwrap();
    assert_eq!(schema.table("users"), Some(&users(plain_name(), true)));

    // The log table is never diffed
    let again = migrator
        .autogenerate(
            &mut db,
            &SchemaSnapshot::new().with_table(users(plain_name(), true)),
            &RenameMap::new(),
            "20250201000001",
            "noop",
        )
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn test_rebuild_keeps_rows_and_rolls_back() {
    let migrator = Migrator::new(MigrateConfig::default());
    let mut db = seeded(&migrator).await;
    let initial = db.read_schema().await.unwrap().table("users").cloned().unwrap();

    let target_users = users(plain_name().default_value("'anonymous'"), false);
    let target = SchemaSnapshot::new().with_table(target_users.clone());
    let migration = migrator
        .autogenerate(&mut db, &target, &RenameMap::new(), "20250202000000", "slim users")
        .await
        .unwrap()
        .unwrap();

    let report = migrator.apply(&mut db, &migration).await.unwrap();
    let kinds: Vec<&str> = report.applied.iter().map(|a| a.operation.kind()).collect();
    assert_eq!(kinds, vec!["alter_column", "drop_column"]);
    assert!(report.applied.iter().all(|a| a.strategy == Strategy::Rebuild));
    assert_eq!(report.applied[0].rebuilt_from.as_ref(), Some(&initial));

    let schema = db.read_schema().await.unwrap();
    assert_eq!(schema.table("users"), Some(&target_users));
    assert!(!schema.contains("__rebuild_users"));
    assert_eq!(
        names(&mut db).await,
        vec![(1, "ada".to_string()), (2, "grace".to_string())]
    );

    // New default is live
    sqlx::query("INSERT INTO users (id) VALUES (3)")
        .execute(db.connection())
        .await
        .unwrap();

    let rolled_back = migrator.rollback(&mut db).await.unwrap().unwrap();
    assert_eq!(rolled_back.reverted, 2);

    let schema = db.read_schema().await.unwrap();
    assert_eq!(schema.table("users"), Some(&initial));
    assert_eq!(
        names(&mut db).await,
        vec![
            (1, "ada".to_string()),
            (2, "grace".to_string()),
            (3, "anonymous".to_string())
        ]
    );
    let emails: Vec<(Option<String>,)> = sqlx::query_as("SELECT email FROM users")
        .fetch_all(db.connection())
        .await
        .unwrap();
    assert!(emails.iter().all(|(email,)| email.is_none()));

    assert_eq!(db.entries().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_migration_is_rolled_back() {
    let migrator = Migrator::new(MigrateConfig::default());
    let mut db = seeded(&migrator).await;
    let before = db.read_schema().await.unwrap();

    let migration = MigrationDescriptor::declarative(
        "20250203000000",
        "posts",
        vec![
            Operation::CreateTable {
                table: TableDefinition::new(
                    "posts",
                    vec![ColumnDefinition::new("id", ColumnType::integer()).primary_key()],
                ),
            },
            Operation::AddColumn {
                table: "comments".to_string(),
                column: ColumnDefinition::new("body", ColumnType::text()),
            },
        ],
    );

    let err = migrator.apply(&mut db, &migration).await.unwrap_err();
    assert!(matches!(
        err,
        MigrateError::Execution {
            index: 2,
            total: 2,
            ..
        }
    ));

    assert_eq!(db.read_schema().await.unwrap(), before);
    let versions: Vec<String> = db
        .entries()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec!["20250201000000".to_string()]);
}
