//! End-to-end scenario tests, driven against a real in-process mock server
//! (and, for the proxy scenario, the real `upstream-fixture` child process)
//! over actual HTTP/2 connections — no mocked transport. Grounded on
//! `examples/Shuozeli-grpcurl-rs/grpcurl-cli/tests/common/server.rs`'s
//! spawn-a-real-server-and-drive-real-RPCs pattern.

mod common;

use common::*;
use prost_reflect::Value as ProstValue;

#[tokio::test]
async fn s1_static_mock_returns_configured_fields_and_trailer() {
    let config = r#"
servers:
  - alias: "s1"
    sockets:
      - socket: "127.0.0.1:{{port}}"
    proto_files: "book.proto"
    mocks:
      book.BookService:
        GetBook:
          messages:
            id: "{{ message.id }}"
            name: "Expanded and Revised: Names of the Damned"
            type: "ENCYCLOPEDIA"
            author:
              first_name: "Michael"
              last_name: "Belanger"
          trailing_meta:
            custom_metadata: "metadata"
"#;
    let (server, _dir) = start_mock_server(BOOK_PROTO, config).await;
    let channel = server.channel().await;

    let request_desc = server.registry.message_descriptor("book.GetBookReq").unwrap();
    let request = message_with_i32(&request_desc, "id", 7);

    let (response, metadata) = call_unary(
        channel,
        &server.registry,
        "book.BookService",
        "GetBook",
        "book.GetBookReq",
        "book.Book",
        request,
    )
    .await
    .expect("GetBook should succeed");

    assert_eq!(response.get_field_by_name("id").unwrap().as_i32(), Some(7));
    assert_eq!(
        response.get_field_by_name("name").unwrap().as_str(),
        Some("Expanded and Revised: Names of the Damned")
    );
    assert_eq!(response.get_field_by_name("type").unwrap().as_enum_number(), Some(1));

    let author = response.get_field_by_name("author").unwrap();
    let author = author.as_message().expect("author should be a message");
    assert_eq!(
        author.get_field_by_name("first_name").unwrap().as_str(),
        Some("Michael")
    );
    assert_eq!(
        author.get_field_by_name("last_name").unwrap().as_str(),
        Some("Belanger")
    );

    assert_eq!(
        metadata.get("custom_metadata").and_then(|v| v.to_str().ok()),
        Some("metadata")
    );
}

#[tokio::test]
async fn s2_configured_error_aborts_with_status_and_details() {
    let config = r#"
servers:
  - alias: "s2"
    sockets:
      - socket: "127.0.0.1:{{port}}"
    proto_files: "book.proto"
    mocks:
      book.BookService:
        AddBook:
          error:
            code: 16
            details: "Unauthorized. Credentials required"
"#;
    let (server, _dir) = start_mock_server(BOOK_PROTO, config).await;
    let channel = server.channel().await;

    let request_desc = server.registry.message_descriptor("book.AddBookReq").unwrap();
    let request = empty_message(&request_desc);

    let err = call_unary(
        channel,
        &server.registry,
        "book.BookService",
        "AddBook",
        "book.AddBookReq",
        "book.AddBookResp",
        request,
    )
    .await
    .expect_err("AddBook should be aborted by the configured error");

    assert_eq!(err.code() as i32, 16);
    assert_eq!(err.message(), "Unauthorized. Credentials required");
}

#[tokio::test]
async fn s3_proxy_passes_through_success_and_upstream_failure() {
    let fixture = UpstreamFixture::start();

    let config = format!(
        r#"
servers:
  - alias: "s3"
    sockets:
      - socket: "127.0.0.1:{{{{port}}}}"
    proto_files: "book.proto"
    mocks:
      book.BookService:
        GetBooksList:
          proxy:
            socket: "{socket}"
            seconds_timeout: 10
"#,
        socket = fixture.socket(),
    );
    let (server, _dir) = start_mock_server(BOOK_PROTO, &config).await;

    let upstream_channel = tonic::transport::Channel::from_shared(format!("http://{}", fixture.socket()))
        .unwrap()
        .connect()
        .await
        .expect("connect to upstream-fixture");

    let book_desc = server.registry.message_descriptor("book.Book").unwrap();
    let add_req_desc = server.registry.message_descriptor("book.AddBookReq").unwrap();

    for id in [1, 2] {
        let mut book = prost_reflect::DynamicMessage::new(book_desc.clone());
        book.set_field_by_name("id", ProstValue::I32(id));
        let mut add_req = prost_reflect::DynamicMessage::new(add_req_desc.clone());
        add_req.set_field_by_name("book", ProstValue::Message(book));

        call_unary(
            upstream_channel.clone(),
            &server.registry,
            "book.BookService",
            "AddBook",
            "book.AddBookReq",
            "book.AddBookResp",
            add_req,
        )
        .await
        .expect("AddBook against upstream-fixture should succeed");
    }

    let list_req_desc = server.registry.message_descriptor("book.GetBooksListReq").unwrap();
    let channel = server.channel().await;
    let (response, _metadata) = call_unary(
        channel.clone(),
        &server.registry,
        "book.BookService",
        "GetBooksList",
        "book.GetBooksListReq",
        "book.GetBooksListResp",
        empty_message(&list_req_desc),
    )
    .await
    .expect("proxied GetBooksList should succeed");

    let books = response.get_field_by_name("books").unwrap();
    let books = books.as_list().expect("books should be a repeated field");
    let ids: Vec<i32> = books
        .iter()
        .map(|b| b.as_message().unwrap().get_field_by_name("id").unwrap().as_i32().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2]);

    // Arm the fixture to fail the next GetBooksList call.
    let mut arm_book = prost_reflect::DynamicMessage::new(book_desc.clone());
    arm_book.set_field_by_name("id", ProstValue::I32(-1));
    let mut arm_req = prost_reflect::DynamicMessage::new(add_req_desc.clone());
    arm_req.set_field_by_name("book", ProstValue::Message(arm_book));
    call_unary(
        upstream_channel,
        &server.registry,
        "book.BookService",
        "AddBook",
        "book.AddBookReq",
        "book.AddBookResp",
        arm_req,
    )
    .await
    .expect("arming AddBook call should succeed");

    let err = call_unary(
        channel,
        &server.registry,
        "book.BookService",
        "GetBooksList",
        "book.GetBooksListReq",
        "book.GetBooksListResp",
        empty_message(&list_req_desc),
    )
    .await
    .expect_err("armed GetBooksList should fail");

    assert_eq!(err.code(), tonic::Code::NotFound);
    assert_eq!(
        err.metadata().get("x").and_then(|v| v.to_str().ok()),
        Some("y")
    );
}

#[tokio::test]
async fn s4_server_streaming_mock_emits_messages_in_order() {
    let config = r#"
servers:
  - alias: "s4"
    sockets:
      - socket: "127.0.0.1:{{port}}"
    proto_files: "book.proto"
    mocks:
      book.BookService:
        ListBooks:
          messages:
            - id: 1
            - id: 2
            - id: 3
"#;
    let (server, _dir) = start_mock_server(BOOK_PROTO, config).await;
    let channel = server.channel().await;

    let request_desc = server.registry.message_descriptor("book.GetBooksListReq").unwrap();
    let messages = call_server_streaming(
        channel,
        &server.registry,
        "book.BookService",
        "ListBooks",
        "book.GetBooksListReq",
        "book.Book",
        empty_message(&request_desc),
    )
    .await
    .expect("ListBooks should succeed");

    let ids: Vec<i32> = messages
        .iter()
        .map(|m| m.get_field_by_name("id").unwrap().as_i32().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn s5_shell_helper_output_is_parsed_as_yaml() {
    let config = r#"
servers:
  - alias: "s5"
    sockets:
      - socket: "127.0.0.1:{{port}}"
    proto_files: "book.proto"
    mocks:
      book.BookService:
        GetBook:
          messages: '{{ shell(''/bin/echo'', [''-n'', ''{"id": 42, "name": "x"}'']).stdout }}'
"#;
    let (server, _dir) = start_mock_server(BOOK_PROTO, config).await;
    let channel = server.channel().await;

    let request_desc = server.registry.message_descriptor("book.GetBookReq").unwrap();
    let (response, _metadata) = call_unary(
        channel,
        &server.registry,
        "book.BookService",
        "GetBook",
        "book.GetBookReq",
        "book.Book",
        message_with_i32(&request_desc, "id", 1),
    )
    .await
    .expect("GetBook should succeed");

    assert_eq!(response.get_field_by_name("id").unwrap().as_i32(), Some(42));
    assert_eq!(response.get_field_by_name("name").unwrap().as_str(), Some("x"));
}

#[tokio::test]
async fn s6_state_persists_and_advances_across_sequential_calls() {
    let config = r#"
servers:
  - alias: "s6"
    sockets:
      - socket: "127.0.0.1:{{port}}"
    proto_files: "book.proto"
    mocks:
      book.BookService:
        GetBook:
          messages:
            id: "{{ get_state() or 0 }}"
            name: "{% set _ = set_state((get_state() or 0) + 1) %}"
"#;
    let (server, _dir) = start_mock_server(BOOK_PROTO, config).await;

    let request_desc = server.registry.message_descriptor("book.GetBookReq").unwrap();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let channel = server.channel().await;
        let (response, _metadata) = call_unary(
            channel,
            &server.registry,
            "book.BookService",
            "GetBook",
            "book.GetBookReq",
            "book.Book",
            message_with_i32(&request_desc, "id", 1),
        )
        .await
        .expect("GetBook should succeed");
        ids.push(response.get_field_by_name("id").unwrap().as_i32().unwrap());
    }

    assert_eq!(ids, vec![0, 1, 2]);
}
