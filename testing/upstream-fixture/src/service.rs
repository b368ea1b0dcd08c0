use std::sync::Mutex;

use tonic::{Request, Response, Status};

use crate::pb::{
    AddBookReq, AddBookResp, Book, GetBookReq, GetBooksListReq, GetBooksListResp,
};

/// Sending this id to `AddBook` arms the fixture to fail the next `GetBooksList`
/// call with NOT_FOUND and an `x: y` trailer, exercising the S3 error path.
const ARM_FAILURE_ID: i32 = -1;

#[derive(Default)]
pub struct BookServiceImpl {
    books: Mutex<Vec<Book>>,
    fail_next_list: Mutex<bool>,
}

#[tonic::async_trait]
impl crate::pb::book_service_server::BookService for BookServiceImpl {
    async fn get_book(&self, request: Request<GetBookReq>) -> Result<Response<Book>, Status> {
        let id = request.into_inner().id;
        let books = self.books.lock().unwrap();
        books
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .map(Response::new)
            .ok_or_else(|| Status::not_found(format!("book {id} not found")))
    }

    async fn add_book(
        &self,
        request: Request<AddBookReq>,
    ) -> Result<Response<AddBookResp>, Status> {
        let book = request.into_inner().book.unwrap_or_default();
        if book.id == ARM_FAILURE_ID {
            *self.fail_next_list.lock().unwrap() = true;
            return Ok(Response::new(AddBookResp { id: ARM_FAILURE_ID }));
        }
        let id = book.id;
        self.books.lock().unwrap().push(book);
        Ok(Response::new(AddBookResp { id }))
    }

    async fn get_books_list(
        &self,
        _request: Request<GetBooksListReq>,
    ) -> Result<Response<GetBooksListResp>, Status> {
        let mut fail = self.fail_next_list.lock().unwrap();
        if *fail {
            *fail = false;
            let mut status = Status::not_found("upstream unavailable");
            status
                .metadata_mut()
                .insert("x", "y".parse().unwrap());
            return Err(status);
        }
        let books = self.books.lock().unwrap().clone();
        Ok(Response::new(GetBooksListResp { books }))
    }
}
