use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::catalog::TableInfo;

const DEMO_SCHEMA: &str = "
CREATE TABLE clientes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nome TEXT NOT NULL,
    cidade TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE
);

CREATE TABLE produtos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nome TEXT NOT NULL,
    preco REAL NOT NULL
);

CREATE TABLE vendas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cliente_id INTEGER,
    produto_id INTEGER,
    quantidade INTEGER NOT NULL,
    data_venda TEXT NOT NULL,
    FOREIGN KEY (cliente_id) REFERENCES clientes (id),
    FOREIGN KEY (produto_id) REFERENCES produtos (id)
);
";

const CLIENTES: [(&str, &str, &str); 5] = [
    ("Alice Silva", "São Paulo", "alice.silva@email.com"),
    ("Beto Costa", "Rio de Janeiro", "beto.costa@email.com"),
    ("Carlos Souza", "Belo Horizonte", "carlos.souza@email.com"),
    ("Diana Martins", "Porto Alegre", "diana.martins@email.com"),
    ("Eduardo Lima", "Salvador", "eduardo.lima@email.com"),
];

const PRODUTOS: [(&str, f64); 6] = [
    ("Laptop Pro", 4500.00),
    ("Mouse Gamer", 250.00),
    ("Teclado Mecânico", 350.50),
    ("Monitor 4K", 1800.75),
    ("Webcam HD", 150.00),
    ("Fone de Ouvido", 299.90),
];

// (cliente_id, produto_id, quantidade, data_venda)
const VENDAS: [(i64, i64, i64, &str); 11] = [
    (1, 1, 1, "2024-01-15"),
    (1, 2, 2, "2024-01-18"),
    (1, 4, 1, "2024-02-10"),
    (2, 1, 2, "2024-01-20"),
    (2, 3, 2, "2024-01-25"),
    (2, 6, 1, "2024-03-05"),
    (3, 5, 3, "2024-02-01"),
    (4, 2, 1, "2024-02-12"),
    (4, 3, 1, "2024-02-12"),
    (5, 4, 1, "2024-03-10"),
    (5, 6, 1, "2024-03-15"),
];

/// Descriptions to register the demo tables with.
pub fn demo_tables() -> Vec<TableInfo> {
    [
        (
            "clientes",
            "Esta tabela armazena informações sobre os clientes. Contém nome, cidade e email de cada cliente.",
        ),
        (
            "produtos",
            "Esta tabela contém a lista de todos os produtos disponíveis para venda. Inclui o nome do produto e seu preço unitário.",
        ),
        (
            "vendas",
            "Esta é a tabela de transações, registrando todas as vendas realizadas, conectando clientes a produtos.",
        ),
    ]
    .into_iter()
    .map(|(table_name, description)| TableInfo {
        table_name: table_name.to_string(),
        description: description.to_string(),
    })
    .collect()
}

/// Create the sales tables on `conn` and fill them with the sample rows.
pub fn seed_sales_database(conn: &Connection) -> Result<()> {
    conn.execute_batch(DEMO_SCHEMA)
        .context("Failed to create demo tables")?;

    for (nome, cidade, email) in CLIENTES {
        conn.execute(
            "INSERT INTO clientes (nome, cidade, email) VALUES (?1, ?2, ?3)",
            params![nome, cidade, email],
        )?;
    }

    for (nome, preco) in PRODUTOS {
        conn.execute(
            "INSERT INTO produtos (nome, preco) VALUES (?1, ?2)",
            params![nome, preco],
        )?;
    }

    for (cliente_id, produto_id, quantidade, data_venda) in VENDAS {
        conn.execute(
            "INSERT INTO vendas (cliente_id, produto_id, quantidade, data_venda) VALUES (?1, ?2, ?3, ?4)",
            params![cliente_id, produto_id, quantidade, data_venda],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_expected_row_counts() {
        let conn = Connection::open_in_memory().unwrap();
        seed_sales_database(&conn).unwrap();

        let count = |table: &str| -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count("clientes"), 5);
        assert_eq!(count("produtos"), 6);
        assert_eq!(count("vendas"), 11);
    }

    #[test]
    fn beto_outspends_alice_in_january() {
        let conn = Connection::open_in_memory().unwrap();
        seed_sales_database(&conn).unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT c.nome, SUM(v.quantidade * p.preco) AS total
                 FROM vendas v
                 JOIN clientes c ON c.id = v.cliente_id
                 JOIN produtos p ON p.id = v.produto_id
                 WHERE v.data_venda BETWEEN '2024-01-01' AND '2024-01-31'
                 GROUP BY c.id
                 ORDER BY total DESC",
            )
            .unwrap();
        let totals = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(totals[0].0, "Beto Costa");
        assert_eq!(totals[1].0, "Alice Silva");
        assert!(totals[0].1 > totals[1].1);
    }

    #[test]
    fn demo_tables_cover_the_schema() {
        let names: Vec<_> = demo_tables().into_iter().map(|t| t.table_name).collect();
        assert_eq!(names, vec!["clientes", "produtos", "vendas"]);
    }
}
