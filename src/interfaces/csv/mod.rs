pub mod issue_writer;
