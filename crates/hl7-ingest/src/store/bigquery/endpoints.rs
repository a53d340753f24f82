//! BigQuery v2 REST endpoint URL builders

use crate::store::TableRef;

/// Public BigQuery v2 endpoint
pub const DEFAULT_API_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Build a dataset URL (`datasets.get`)
pub fn dataset_url(base_url: &str, project: &str, dataset: &str) -> String {
    format!("{}/projects/{}/datasets/{}", base_url, project, dataset)
}

/// Build the table collection URL (`tables.insert`)
pub fn tables_url(base_url: &str, project: &str, dataset: &str) -> String {
    format!("{}/tables", dataset_url(base_url, project, dataset))
}

/// Build a single table URL (`tables.get`, `tables.patch`)
pub fn table_url(base_url: &str, table: &TableRef) -> String {
    format!(
        "{}/{}",
        tables_url(base_url, &table.project, &table.dataset),
        table.table
    )
}

/// Build the streaming insert URL (`tabledata.insertAll`)
pub fn insert_all_url(base_url: &str, table: &TableRef) -> String {
    format!("{}/insertAll", table_url(base_url, table))
}

/// Build the synchronous query URL (`jobs.query`)
pub fn query_url(base_url: &str, project: &str) -> String {
    format!("{}/projects/{}/queries", base_url, project)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_urls() {
        let table = TableRef::new("acme", "hl7_data", "pid");

        assert_eq!(
            dataset_url("http://localhost:9050", "acme", "hl7_data"),
            "http://localhost:9050/projects/acme/datasets/hl7_data"
        );
        assert_eq!(
            tables_url("http://localhost:9050", "acme", "hl7_data"),
            "http://localhost:9050/projects/acme/datasets/hl7_data/tables"
        );
        assert_eq!(
            table_url(DEFAULT_API_URL, &table),
            "https://bigquery.googleapis.com/bigquery/v2/projects/acme/datasets/hl7_data/tables/pid"
        );
        assert_eq!(
            insert_all_url("http://localhost:9050", &table),
            "http://localhost:9050/projects/acme/datasets/hl7_data/tables/pid/insertAll"
        );
    }

    #[test]
    fn test_query_url() {
        assert_eq!(
            query_url("http://localhost:9050", "acme"),
            "http://localhost:9050/projects/acme/queries"
        );
    }
}
